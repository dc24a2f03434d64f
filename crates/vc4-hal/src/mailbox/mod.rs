//! Client for the firmware property channel (`/dev/vcio`).
//!
//! Every operation is a single blocking ioctl. The transport is behind a mutex, so at most one
//! call is in flight per [`Mailbox`]. A failed ioctl is fatal ([`HalError::Transport`]); a
//! request the firmware answered negatively is reported as `false`, `0` or `None`.

pub mod message;
pub mod transport;

use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{DeviceMemory, QpuExecutor, SystemQueries, SystemQuery};
use crate::error::{HalError, HalResult};
use crate::execution::{ExecutionHandle, QpuDispatch};
use crate::memory::{
    map_physical, BufferRelease, BufferRequest, CacheType, DeviceBuffer, DevicePointer,
    HostMemory, PAGE_ALIGNMENT,
};

pub use message::{Clock, MailboxMessage, MailboxStatus, MailboxTag, MemoryFlags, RESPONSE_SUCCESS};
pub use transport::{MailboxTransport, VcioDevice, VCIO_PATH};

/// Mailbox memory flags used for a cache policy.
pub fn memory_flags(cache: CacheType) -> MemoryFlags {
    match cache {
        CacheType::Uncached => MemoryFlags::DIRECT,
        CacheType::GpuCached => MemoryFlags::NORMAL,
        CacheType::HostCached | CacheType::BothCached => MemoryFlags::L1_NONALLOCATING,
    }
}

pub struct Mailbox {
    transport: Mutex<Box<dyn MailboxTransport>>,
}

impl Mailbox {
    /// Opens `/dev/vcio` and enables the QPUs.
    pub fn open() -> HalResult<Self> {
        Self::new(Box::new(VcioDevice::open()?))
    }

    /// Wraps `transport` and enables the QPUs. They are disabled again on drop.
    pub fn new(transport: Box<dyn MailboxTransport>) -> HalResult<Self> {
        let mailbox = Self {
            transport: Mutex::new(transport),
        };
        if !mailbox.enable_qpu(true)? {
            return Err(HalError::Firmware {
                call: "enable QPUs",
                status: -1,
            });
        }
        Ok(mailbox)
    }

    /// Performs one round-trip, leaving the response in `message`.
    pub fn call(&self, message: &mut MailboxMessage) -> HalResult<MailboxStatus> {
        let tag = message.tag();
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);

        #[cfg(feature = "syscall-trace")]
        tracing::trace!(tag, "mailbox request: {}", message::hex_dump(message.as_words()));

        transport
            .property_call(message.as_words_mut())
            .map_err(|source| HalError::Transport { tag, source })?;

        #[cfg(feature = "syscall-trace")]
        tracing::trace!(tag, "mailbox response: {}", message::hex_dump(message.as_words()));

        let status = message.status();
        if !status.is_success() {
            tracing::debug!(tag, ?status, "mailbox request was not successful");
        }
        Ok(status)
    }

    /// Sends a request, returning the response only if the firmware accepted it.
    pub fn request(
        &self,
        tag: MailboxTag,
        request: &[u32],
        response_words: usize,
    ) -> HalResult<Option<MailboxMessage>> {
        let mut message = MailboxMessage::new(tag, request, response_words);
        Ok(self.call(&mut message)?.is_success().then_some(message))
    }

    fn request_word(
        &self,
        tag: MailboxTag,
        request: &[u32],
        response_words: usize,
        index: usize,
    ) -> HalResult<Option<u32>> {
        Ok(self
            .request(tag, request, response_words)?
            .map(|response| response.content(index)))
    }

    /// Enables (or disables) the QPUs. The firmware reference-counts this, so a response of
    /// [`RESPONSE_SUCCESS`] ("already enabled") counts as success.
    pub fn enable_qpu(&self, enable: bool) -> HalResult<bool> {
        let status = self.request_word(MailboxTag::EnableQpu, &[u32::from(enable)], 1, 0)?;
        Ok(matches!(status, Some(0) | Some(RESPONSE_SUCCESS)))
    }

    /// Allocates GPU memory. Returns the firmware handle, or 0 on failure.
    pub fn allocate(&self, size: u32, alignment: u32, flags: MemoryFlags) -> HalResult<u32> {
        Ok(self
            .request_word(MailboxTag::AllocateMemory, &[size, alignment, flags.bits()], 1, 0)?
            .unwrap_or(0))
    }

    /// Locks an allocation in place. Returns its bus address, or null on failure.
    pub fn lock(&self, handle: u32) -> HalResult<DevicePointer> {
        Ok(DevicePointer::new(
            self.request_word(MailboxTag::LockMemory, &[handle], 1, 0)?
                .unwrap_or(0),
        ))
    }

    pub fn unlock(&self, handle: u32) -> HalResult<bool> {
        Ok(self.request_word(MailboxTag::UnlockMemory, &[handle], 1, 0)? == Some(0))
    }

    pub fn release(&self, handle: u32) -> HalResult<bool> {
        Ok(self.request_word(MailboxTag::ReleaseMemory, &[handle], 1, 0)? == Some(0))
    }

    /// Runs VPU code at `code` with `r0..r5` set to `registers`. Returns the final `r0`.
    pub fn execute_code(&self, code: DevicePointer, registers: [u32; 6]) -> HalResult<Option<u32>> {
        let mut request = [0u32; 7];
        request[0] = code.value();
        request[1..].copy_from_slice(&registers);
        self.request_word(MailboxTag::ExecuteCode, &request, 1, 0)
    }

    pub fn firmware_revision(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::FirmwareRevision, &[], 1, 0)
    }

    pub fn board_model(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::BoardModel, &[], 1, 0)
    }

    pub fn board_revision(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::BoardRevision, &[], 1, 0)
    }

    pub fn board_serial(&self) -> HalResult<Option<u64>> {
        Ok(self
            .request(MailboxTag::BoardSerial, &[], 2)?
            .map(|r| u64::from(r.content(0)) | (u64::from(r.content(1)) << 32)))
    }

    pub fn mac_address(&self) -> HalResult<Option<[u8; 6]>> {
        Ok(self.request(MailboxTag::MacAddress, &[], 2)?.map(|r| {
            let low = r.content(0).to_le_bytes();
            let high = r.content(1).to_le_bytes();
            [low[0], low[1], low[2], low[3], high[0], high[1]]
        }))
    }

    /// ARM memory split as `(base, size)` in bytes.
    pub fn arm_memory(&self) -> HalResult<Option<(u32, u32)>> {
        Ok(self
            .request(MailboxTag::ArmMemory, &[], 2)?
            .map(|r| (r.content(0), r.content(1))))
    }

    /// VideoCore memory split as `(base, size)` in bytes.
    pub fn vc_memory(&self) -> HalResult<Option<(u32, u32)>> {
        Ok(self
            .request(MailboxTag::VcMemory, &[], 2)?
            .map(|r| (r.content(0), r.content(1))))
    }

    /// Configured clock rate in Hz.
    pub fn clock_rate(&self, clock: Clock) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetClockRate, &[clock as u32], 2, 1)
    }

    /// Clock rate in Hz as measured by the firmware.
    pub fn measured_clock_rate(&self, clock: Clock) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetClockRateMeasured, &[clock as u32], 2, 1)
    }

    pub fn max_clock_rate(&self, clock: Clock) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetMaxClockRate, &[clock as u32], 2, 1)
    }

    pub fn min_clock_rate(&self, clock: Clock) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetMinClockRate, &[clock as u32], 2, 1)
    }

    /// SoC temperature in thousandths of a degree Celsius.
    pub fn temperature(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetTemperature, &[0], 2, 1)
    }

    pub fn max_temperature(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetMaxTemperature, &[0], 2, 1)
    }

    /// Voltage of domain `id` (1 = core) as an offset from 1.2 V, in microvolts.
    pub fn voltage(&self, id: u32) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetVoltage, &[id], 2, 1)
    }

    /// Throttling/under-voltage bit set as reported by the firmware.
    pub fn throttled(&self) -> HalResult<Option<u32>> {
        self.request_word(MailboxTag::GetThrottled, &[0xFFFF], 1, 0)
    }

    fn query(&self, query: SystemQuery) -> HalResult<Option<u32>> {
        match query {
            SystemQuery::CurrentQpuClockRateHz => self.clock_rate(Clock::V3d),
            SystemQuery::MaximumQpuClockRateHz => self.max_clock_rate(Clock::V3d),
            SystemQuery::CurrentArmClockRateHz => self.clock_rate(Clock::Arm),
            SystemQuery::MaximumArmClockRateHz => self.max_clock_rate(Clock::Arm),
            SystemQuery::QpuTemperatureMilliDegrees => self.temperature(),
            SystemQuery::TotalArmMemoryBytes => Ok(self.arm_memory()?.map(|(_, size)| size)),
            SystemQuery::TotalGpuMemoryBytes => Ok(self.vc_memory()?.map(|(_, size)| size)),
            SystemQuery::TotalVpmMemoryBytes | SystemQuery::NumQpus => Ok(None),
        }
    }
}

impl SystemQueries for Mailbox {
    fn read_value(&self, query: SystemQuery) -> Option<u32> {
        match self.query(query) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(?query, error = %err, "mailbox query failed");
                None
            }
        }
    }
}

impl DeviceMemory for Mailbox {
    fn allocate_buffer(
        self: Arc<Self>,
        request: &BufferRequest<'_>,
    ) -> HalResult<Option<DeviceBuffer>> {
        request.validate()?;
        // Host mappings are page granular.
        let alignment = request.alignment.max(PAGE_ALIGNMENT);
        let handle = self.allocate(request.size, alignment, memory_flags(request.cache))?;
        if handle == 0 {
            tracing::debug!(size = request.size, "mailbox allocation failed");
            return Ok(None);
        }

        let device_ptr = self.lock(handle)?;
        if device_ptr.is_null() {
            tracing::debug!(handle, "failed to lock mailbox allocation");
            self.release(handle)?;
            return Ok(None);
        }

        let map = match map_physical(device_ptr.to_physical(), request.size as usize) {
            Ok(map) => map,
            Err(err) => {
                self.unlock(handle)?;
                self.release(handle)?;
                return Err(err);
            }
        };

        tracing::debug!(handle, size = request.size, %device_ptr, "allocated mailbox buffer");
        Ok(Some(DeviceBuffer::new(
            self,
            handle,
            device_ptr,
            HostMemory::Mapped(map),
            request.size,
        )))
    }

    fn deallocate(&self, release: BufferRelease) -> HalResult<bool> {
        let unlocked = self.unlock(release.handle)?;
        let released = self.release(release.handle)?;
        tracing::debug!(handle = release.handle, unlocked, released, "released mailbox buffer");
        Ok(unlocked && released)
    }
}

impl QpuExecutor for Mailbox {
    fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle> {
        dispatch.validate()?;
        let Some(timeout_ms) = dispatch.timeout_ms() else {
            tracing::warn!(timeout = ?dispatch.timeout, "execution timeout does not fit the mailbox");
            return Ok(ExecutionHandle::failed());
        };
        let result = self.request_word(
            MailboxTag::ExecuteQpu,
            &[
                dispatch.num_qpus(),
                dispatch.control_address.value(),
                u32::from(!dispatch.flush_cache),
                timeout_ms,
            ],
            1,
            0,
        )?;
        Ok(ExecutionHandle::resolved(result == Some(0)))
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        match self.enable_qpu(false) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("firmware refused to disable the QPUs"),
            Err(err) => tracing::warn!(error = %err, "failed to disable the QPUs"),
        }
    }
}
