//! In-process stand-in for the hardware backends.
//!
//! Buffers live in a fixed table of [`MAX_BUFFERS`] slots. The slot index is encoded in bits
//! 23..30 of the device pointer, so every buffer owns an 8 MiB window of the emulated bus address
//! space and a device pointer maps back to its buffer with a shift. Kernels are handed to a
//! [`QpuEmulator`]; this module never looks at QPU instructions itself.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{DeviceMemory, QpuExecutor, SystemQueries, SystemQuery};
use crate::error::HalResult;
use crate::execution::{ExecutionHandle, QpuDispatch};
use crate::memory::{
    BufferRelease, BufferRequest, DeviceBuffer, DevicePointer, HostMemory, BUS_ALIAS_MASK,
};

/// Bit position of the slot index in an emulated device pointer.
pub const INDEX_OFFSET: u32 = 23;
/// Largest buffer that fits a slot's address window.
pub const SLOT_WINDOW: u32 = 1 << INDEX_OFFSET;
pub const MAX_BUFFERS: usize = 1 << (30 - INDEX_OFFSET);

/// Granularity of simulated memory reads.
pub const CACHE_LINE_SIZE: u32 = 64;
/// Extra lines past the nominal end of every buffer, so chunked reads never leave the buffer.
const SAFETY_LINES: u32 = 2;

pub const QPU_CLOCK_HZ: u32 = 250_000_000;
pub const ARM_CLOCK_HZ: u32 = 1_000_000_000;
pub const QPU_COUNT: u32 = 12;
pub const TEMPERATURE_MILLI_DEGREES: u32 = 25_000;
pub const TOTAL_MEMORY_BYTES: u32 = 1 << 30;
pub const VPM_MEMORY_BYTES: u32 = 12 * 1024;
/// QPU cycles emulated per millisecond of execution timeout.
pub const CYCLES_PER_MS: u64 = (QPU_CLOCK_HZ / 1000) as u64;

/// One live buffer as the emulated QPUs see it.
///
/// The host may hold views of the same bytes through the owning [`DeviceBuffer`], exactly as it
/// can for memory shared with the real GPU. Accesses therefore go through raw pointers and never
/// form references; the host must not touch a buffer while a dispatch that uses it runs.
#[derive(Debug, Copy, Clone)]
pub struct GpuRegion<'a> {
    data: NonNull<u8>,
    len: usize,
    _slot: PhantomData<&'a Slot>,
}

impl GpuRegion<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `out.len()` bytes starting at `offset`. Returns false if the range leaves the region.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> bool {
        if !self.contains(offset, out.len()) {
            return false;
        }
        // SAFETY: the range is inside the slot, which outlives `'a`, and `out` is host memory
        // distinct from it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        true
    }

    /// Copies `bytes` to `offset`. Returns false if the range leaves the region.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        if !self.contains(offset, bytes.len()) {
            return false;
        }
        // SAFETY: as in `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.as_ptr().add(offset),
                bytes.len(),
            )
        };
        true
    }

    pub fn read_word(&self, offset: usize) -> Option<u32> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word).then(|| u32::from_le_bytes(word))
    }

    pub fn write_word(&self, offset: usize, word: u32) -> bool {
        self.write(offset, &word.to_le_bytes())
    }

    fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }
}

/// Everything an instruction-level emulator needs to run one dispatch.
pub struct EmulationRequest<'a> {
    /// Every live buffer, keyed by its device pointer.
    pub memory: BTreeMap<DevicePointer, GpuRegion<'a>>,
    pub kernel_entry: DevicePointer,
    pub instruction_count: u32,
    /// One UNIFORM stream per QPU.
    pub uniform_addresses: Vec<DevicePointer>,
    pub max_cycles: u64,
}

impl<'a> EmulationRequest<'a> {
    /// The region holding `address` and the byte offset of `address` inside it.
    pub fn resolve(&self, address: DevicePointer) -> Option<(GpuRegion<'a>, usize)> {
        let (index, offset) = locate(address);
        let region = *self.memory.get(&slot_pointer(index))?;
        (offset < region.len).then_some((region, offset))
    }
}

pub trait QpuEmulator: Send + Sync {
    /// Runs the kernel. Returns whether it completed within `max_cycles`.
    fn emulate(&self, request: EmulationRequest<'_>) -> bool;
}

/// Used when no instruction-level emulator is plugged in: every execution fails.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoQpuEmulator;

impl QpuEmulator for NoQpuEmulator {
    fn emulate(&self, request: EmulationRequest<'_>) -> bool {
        tracing::warn!(
            kernel = %request.kernel_entry,
            "no QPU emulator configured, failing execution"
        );
        false
    }
}

struct Slot {
    data: NonNull<u8>,
    len: usize,
    size: u32,
}

impl Slot {
    fn zeroed(len: usize, size: u32) -> Self {
        let data = Box::into_raw(vec![0u8; len].into_boxed_slice());
        Self {
            // SAFETY: `Box::into_raw` never returns null.
            data: unsafe { NonNull::new_unchecked(data.cast::<u8>()) },
            len,
            size,
        }
    }

    fn region(&self) -> GpuRegion<'_> {
        GpuRegion {
            data: self.data,
            len: self.len,
            _slot: PhantomData,
        }
    }
}

// SAFETY: a slot exclusively owns its heap block; moving the slot moves that ownership.
unsafe impl Send for Slot {}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: allocated as a boxed slice of `len` bytes in `zeroed`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.data.as_ptr(),
                self.len,
            )))
        }
    }
}

pub struct Emulator {
    slots: Mutex<Vec<Option<Slot>>>,
    qpu: Box<dyn QpuEmulator>,
}

/// Rounded allocation size for a buffer of `size` bytes.
pub fn emulated_size(size: u32) -> u32 {
    (size.div_ceil(CACHE_LINE_SIZE) + SAFETY_LINES) * CACHE_LINE_SIZE
}

/// Device pointer of the buffer in slot `index`.
pub fn slot_pointer(index: usize) -> DevicePointer {
    DevicePointer::new((index as u32) << INDEX_OFFSET)
}

/// `(slot index, byte offset)` of an emulated bus address.
pub fn locate(ptr: DevicePointer) -> (usize, usize) {
    let address = ptr.to_physical();
    (
        (address >> INDEX_OFFSET) as usize,
        (address & (SLOT_WINDOW - 1)) as usize,
    )
}

impl Emulator {
    pub fn new(qpu: Box<dyn QpuEmulator>) -> Self {
        Self {
            slots: Mutex::new((0..MAX_BUFFERS).map(|_| None).collect()),
            qpu,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.slots().iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether `handle` denotes a live buffer.
    pub fn is_allocated(&self, handle: u32) -> bool {
        handle != 0
            && self
                .slots()
                .get(handle as usize - 1)
                .is_some_and(|slot| slot.is_some())
    }

    fn read_words(slots: &[Option<Slot>], ptr: DevicePointer, count: usize) -> Option<Vec<u32>> {
        let (index, offset) = locate(ptr);
        let region = slots.get(index)?.as_ref()?.region();
        let mut bytes = vec![0u8; count.checked_mul(4)?];
        if !region.read(offset, &mut bytes) {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(Box::new(NoQpuEmulator))
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        for (index, slot) in self.slots().iter().enumerate() {
            if let Some(slot) = slot {
                tracing::warn!(
                    handle = index + 1,
                    size = slot.size,
                    device_ptr = %slot_pointer(index),
                    "emulated buffer was never released"
                );
            }
        }
    }
}

impl SystemQueries for Emulator {
    fn read_value(&self, query: SystemQuery) -> Option<u32> {
        Some(match query {
            SystemQuery::CurrentQpuClockRateHz | SystemQuery::MaximumQpuClockRateHz => QPU_CLOCK_HZ,
            SystemQuery::CurrentArmClockRateHz | SystemQuery::MaximumArmClockRateHz => ARM_CLOCK_HZ,
            SystemQuery::QpuTemperatureMilliDegrees => TEMPERATURE_MILLI_DEGREES,
            SystemQuery::TotalArmMemoryBytes | SystemQuery::TotalGpuMemoryBytes => {
                TOTAL_MEMORY_BYTES
            }
            SystemQuery::TotalVpmMemoryBytes => VPM_MEMORY_BYTES,
            SystemQuery::NumQpus => QPU_COUNT,
        })
    }
}

impl DeviceMemory for Emulator {
    fn allocate_buffer(
        self: Arc<Self>,
        request: &BufferRequest<'_>,
    ) -> HalResult<Option<DeviceBuffer>> {
        request.validate()?;
        let rounded = emulated_size(request.size);
        if rounded > SLOT_WINDOW {
            tracing::debug!(size = request.size, "emulated buffer exceeds its address window");
            return Ok(None);
        }

        let (index, host) = {
            let mut slots = self.slots();
            let Some(index) = slots.iter().position(|slot| slot.is_none()) else {
                tracing::debug!(size = request.size, "emulated buffer table is full");
                return Ok(None);
            };
            let slot = Slot::zeroed(rounded as usize, request.size);
            let host = slot.data;
            slots[index] = Some(slot);
            (index, host)
        };

        let handle = index as u32 + 1;
        let device_ptr = slot_pointer(index);
        tracing::trace!(handle, size = request.size, %device_ptr, "allocated emulated buffer");
        Ok(Some(DeviceBuffer::new(
            self,
            handle,
            device_ptr,
            HostMemory::Borrowed(host),
            request.size,
        )))
    }

    fn deallocate(&self, release: BufferRelease) -> HalResult<bool> {
        let mut slots = self.slots();
        let slot = (release.handle as usize)
            .checked_sub(1)
            .and_then(|index| slots.get_mut(index));
        match slot.and_then(Option::take) {
            Some(_) => Ok(true),
            None => {
                tracing::warn!(handle = release.handle, "released unknown emulated buffer");
                Ok(false)
            }
        }
    }
}

impl QpuExecutor for Emulator {
    fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle> {
        dispatch.validate()?;
        let slots = self.slots();

        let num_qpus = dispatch.control.len();
        let Some(words) = Self::read_words(&slots, dispatch.control_address, num_qpus * 2) else {
            tracing::debug!(control = %dispatch.control_address, "control block is not in emulated memory");
            return Ok(ExecutionHandle::failed());
        };

        let uniform_addresses: Vec<_> = words
            .chunks_exact(2)
            .map(|pair| DevicePointer::new(pair[0] & !BUS_ALIAS_MASK))
            .collect();
        let kernel_entry = DevicePointer::new(words[1] & !BUS_ALIAS_MASK);
        // The uniforms are laid out directly behind the code.
        let instruction_count =
            uniform_addresses[0].value().saturating_sub(kernel_entry.value()) / 8;
        let max_cycles = dispatch.timeout.as_millis().min(u128::from(u64::MAX / CYCLES_PER_MS))
            as u64
            * CYCLES_PER_MS;

        let memory = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .map(|slot| (slot_pointer(index), slot.region()))
            })
            .collect();

        let passed = self.qpu.emulate(EmulationRequest {
            memory,
            kernel_entry,
            instruction_count,
            uniform_addresses,
            max_cycles,
        });
        drop(slots);
        Ok(ExecutionHandle::resolved(passed))
    }
}
