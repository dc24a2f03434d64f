//! Direct access to the V3D register block.
//!
//! The block is mapped once; afterwards every operation is a handful of volatile loads and
//! stores. Kernel execution writes the user-program request registers and polls the completion
//! counter, so it needs root (for `/dev/mem`) but no firmware round-trip.

pub mod registers;
pub mod regs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::backend::{QpuExecutor, SystemQueries, SystemQuery};
use crate::error::{HalError, HalResult};
use crate::execution::{ExecutionHandle, QpuDispatch, MAX_QPUS};

pub use registers::{MappedRegisters, RegisterBlock, RegisterFile};
use regs::*;

/// Values decoded from the identification and status registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SystemInfo {
    /// Total VPM size in bytes.
    VpmMemorySize,
    /// VPM bytes reserved for user programs.
    VpmUserMemorySize,
    SemaphoreCount,
    TmuPerSlice,
    QpuPerSlice,
    SliceCount,
    QpuCount,
    HdrSupport,
    V3dRevision,
    UserProgramsCompleted,
    UserProgramsRequested,
    UserProgramQueueFull,
    UserProgramQueueLength,
}

/// Hardware events a performance counter can count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CounterType {
    IdleCycles = 13,
    VertexShadingCycles = 14,
    FragmentShadingCycles = 15,
    ExecutionCycles = 16,
    TmuStallCycles = 17,
    ScoreboardStallCycles = 18,
    VaryingsStallCycles = 19,
    InstructionCacheHits = 20,
    InstructionCacheMisses = 21,
    UniformCacheHits = 22,
    UniformCacheMisses = 23,
    TmuTotalWords = 24,
    TmuCacheMisses = 25,
    VdwStallCycles = 26,
    VcdStallCycles = 27,
    L2CacheHits = 28,
    L2CacheMisses = 29,
}

bitflags! {
    /// Program types a QPU refuses to run (`SQRSV0`/`SQRSV1`).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct QpuReservation: u32 {
        const ALLOW_ALL = 0;
        const NO_USER_PROGRAMS = 1 << 0;
        const NO_FRAGMENT_SHADERS = 1 << 1;
        const NO_VERTEX_SHADERS = 1 << 2;
        const NO_COORDINATE_SHADERS = 1 << 3;
    }
}

bitflags! {
    /// Latched error flags (`ERRSTAT`).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct V3dErrors: u32 {
        const VPM_ALLOC_WHILE_BUSY = 1 << 0;
        const VPM_REQUEST_TOO_BIG = 1 << 1;
        const VPM_WRITE_RANGE = 1 << 4;
        const VPM_READ_RANGE = 1 << 5;
        const VPM_READ_NONALLOC = 1 << 6;
        const VPM_WRITE_NONALLOC = 1 << 7;
        const VPM_FREE_NONALLOC = 1 << 8;
        const VPM_SIZE_ERROR = 1 << 9;
        const VDW_OVERFLOW = 1 << 10;
        const VCD_OUT_OF_SYNC = 1 << 11;
        const VCD_IDLE = 1 << 12;
        const L2_CACHE_ALIAS_ERROR = 1 << 15;
    }
}

/// QPU count reported when `IDENT1` does not decode to something plausible.
const FALLBACK_QPU_COUNT: u32 = 12;
/// Semaphore count reported when `IDENT1` leaves the field empty.
const FALLBACK_SEMAPHORE_COUNT: u32 = 16;

pub struct V3d {
    registers: Arc<dyn RegisterBlock>,
    poll_interval_ns: AtomicU64,
}

impl V3d {
    /// Maps the V3D block of a SoC whose peripherals start at `peripheral_base`.
    pub fn open(peripheral_base: u32) -> HalResult<Self> {
        let v3d = Self::new(Arc::new(MappedRegisters::map(peripheral_base)?));
        let ident0 = v3d.registers.read(V3D_IDENT0);
        if ident0 & IDENT0_ID_MASK != IDENT0_ID {
            tracing::warn!(ident0 = format_args!("{ident0:#010x}"), "unexpected V3D identification (power-gated?)");
        }
        Ok(v3d)
    }

    pub fn new(registers: Arc<dyn RegisterBlock>) -> Self {
        Self {
            registers,
            poll_interval_ns: AtomicU64::new(0),
        }
    }

    pub fn registers(&self) -> &Arc<dyn RegisterBlock> {
        &self.registers
    }

    /// Sleep between two polls of the completion counter. Zero spins.
    pub fn set_poll_interval(&self, interval: Duration) {
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.poll_interval_ns.store(nanos, Ordering::Relaxed);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_nanos(self.poll_interval_ns.load(Ordering::Relaxed))
    }

    /// Technology version from `IDENT0`.
    pub fn technology_version(&self) -> u32 {
        self.registers.read(V3D_IDENT0) >> IDENT0_TVER_SHIFT
    }

    pub fn system_info(&self, info: SystemInfo) -> u32 {
        let ident1 = || self.registers.read(V3D_IDENT1);
        let srqcs = || self.registers.read(V3D_SRQCS);
        match info {
            SystemInfo::VpmMemorySize => {
                // A size field of 0 means 16 KiB.
                let kib = ident1() >> IDENT1_VPMSZ_SHIFT;
                if kib == 0 {
                    16 * 1024
                } else {
                    kib * 1024
                }
            }
            SystemInfo::VpmUserMemorySize => {
                (self.registers.read(V3D_VPMBASE) & VPMBASE_VPMURSV_MASK) * VPMBASE_UNIT_BYTES
            }
            SystemInfo::SemaphoreCount => match (ident1() >> IDENT1_NSEM_SHIFT) & 0xFF {
                0 => FALLBACK_SEMAPHORE_COUNT,
                n => n,
            },
            SystemInfo::TmuPerSlice => (ident1() >> IDENT1_TUPS_SHIFT) & 0xF,
            SystemInfo::QpuPerSlice => (ident1() >> IDENT1_QUPS_SHIFT) & 0xF,
            SystemInfo::SliceCount => (ident1() >> IDENT1_NSLC_SHIFT) & 0xF,
            SystemInfo::QpuCount => {
                let ident1 = ident1();
                let count = ((ident1 >> IDENT1_NSLC_SHIFT) & 0xF) * ((ident1 >> IDENT1_QUPS_SHIFT) & 0xF);
                if count == 0 || count as usize > MAX_QPUS {
                    tracing::debug!(count, "implausible QPU count in IDENT1");
                    FALLBACK_QPU_COUNT
                } else {
                    count
                }
            }
            SystemInfo::HdrSupport => (ident1() >> IDENT1_HDRT_SHIFT) & 0x1,
            SystemInfo::V3dRevision => ident1() & IDENT1_REVR_MASK,
            SystemInfo::UserProgramsCompleted => {
                (srqcs() >> SRQCS_COMPLETED_SHIFT) & SRQCS_COUNT_MASK
            }
            SystemInfo::UserProgramsRequested => {
                (srqcs() >> SRQCS_REQUESTS_SHIFT) & SRQCS_COUNT_MASK
            }
            SystemInfo::UserProgramQueueFull => (srqcs() >> SRQCS_QFULL_SHIFT) & 0x1,
            SystemInfo::UserProgramQueueLength => srqcs() & SRQCS_QLEN_MASK,
        }
    }

    fn check_counter(index: u8) -> HalResult<()> {
        if index >= COUNTER_COUNT {
            return Err(HalError::CounterIndexOutOfRange {
                index,
                max: COUNTER_COUNT - 1,
            });
        }
        Ok(())
    }

    /// Maps counter `index` to `counter_type`, enables it and zeroes its value.
    pub fn set_counter(&self, index: u8, counter_type: CounterType) -> HalResult<()> {
        Self::check_counter(index)?;
        let enabled = self.registers.read(V3D_PCTRE);
        self.registers
            .write(V3D_PCTRE, enabled | PCTRE_ENABLE | (1 << index));
        self.registers
            .write(counter_mapping(index), u32::from(counter_type as u8) & PCTRS_MASK);
        self.registers.write(counter_value(index), 0);
        Ok(())
    }

    pub fn reset_counter_value(&self, index: u8) -> HalResult<()> {
        Self::check_counter(index)?;
        self.registers.write(V3D_PCTRC, 1 << index);
        Ok(())
    }

    pub fn get_counter(&self, index: u8) -> HalResult<u32> {
        Self::check_counter(index)?;
        match self.registers.read(counter_value(index)) {
            POWER_GATED_SENTINEL => Err(HalError::CounterPowerGated { index }),
            value => Ok(value),
        }
    }

    /// Stops counter `index`. Counting stays globally enabled for the other counters.
    pub fn disable_counter(&self, index: u8) -> HalResult<()> {
        Self::check_counter(index)?;
        self.registers.write_masked(V3D_PCTRE, 1 << index, 0);
        Ok(())
    }

    fn reservation_location(qpu: u8) -> HalResult<(u32, u32)> {
        if qpu >= RESERVATION_QPU_COUNT {
            return Err(HalError::QpuIndexOutOfRange {
                index: qpu,
                max: RESERVATION_QPU_COUNT - 1,
            });
        }
        let register = if qpu < QPUS_PER_RESERVATION_REGISTER {
            V3D_SQRSV0
        } else {
            V3D_SQRSV1
        };
        let shift = u32::from(qpu % QPUS_PER_RESERVATION_REGISTER) * RESERVATION_BITS;
        Ok((register, shift))
    }

    pub fn set_reservation(&self, qpu: u8, reservation: QpuReservation) -> HalResult<()> {
        let (register, shift) = Self::reservation_location(qpu)?;
        self.registers.write_masked(
            register,
            RESERVATION_MASK << shift,
            (reservation.bits() & RESERVATION_MASK) << shift,
        );
        Ok(())
    }

    pub fn reservation(&self, qpu: u8) -> HalResult<QpuReservation> {
        let (register, shift) = Self::reservation_location(qpu)?;
        let bits = (self.registers.read(register) >> shift) & RESERVATION_MASK;
        Ok(QpuReservation::from_bits_truncate(bits))
    }

    /// Returns whether `error` is latched, clearing it.
    pub fn has_error(&self, error: V3dErrors) -> bool {
        let set = self.registers.read(V3D_ERRSTAT) & error.bits();
        if set != 0 {
            self.registers.write(V3D_ERRSTAT, set);
        }
        set != 0
    }

    /// Returns every latched error flag, clearing them.
    pub fn take_errors(&self) -> V3dErrors {
        let errors = V3dErrors::from_bits_truncate(self.registers.read(V3D_ERRSTAT));
        if !errors.is_empty() {
            self.registers.write(V3D_ERRSTAT, errors.bits());
        }
        errors
    }

    /// Dispatches one user program per control pair and polls until all of them completed or
    /// `timeout` (measured from the dispatch) elapsed.
    pub fn execute(&self, control: &[[u32; 2]], flush_cache: bool, timeout: Duration) -> bool {
        let start = Instant::now();
        let expected = control.len() as u32 & SRQCS_COUNT_MASK;

        if flush_cache {
            self.registers.write(V3D_L2CACTL, L2CACTL_L2CCLR);
            self.registers.write(V3D_SLCACTL, SLCACTL_CLEAR_ALL);
        }

        self.registers.write(
            V3D_SRQCS,
            SRQCS_QERROR | SRQCS_CLEAR_REQUESTS | SRQCS_CLEAR_COMPLETED,
        );

        for &[uniforms, program] in control {
            self.registers.write(V3D_SRQUA, uniforms);
            self.registers.write(V3D_SRQPC, program);
        }

        let interval = self.poll_interval();
        loop {
            if self.system_info(SystemInfo::UserProgramsCompleted) == expected {
                tracing::trace!(elapsed = ?start.elapsed(), programs = expected, "V3D execution finished");
                return true;
            }
            if start.elapsed() >= timeout {
                tracing::debug!(
                    ?timeout,
                    completed = self.system_info(SystemInfo::UserProgramsCompleted),
                    programs = expected,
                    "V3D execution timed out"
                );
                return false;
            }
            if interval.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
            }
        }
    }
}

impl SystemQueries for V3d {
    fn read_value(&self, query: SystemQuery) -> Option<u32> {
        if self.registers.read(V3D_IDENT1) == POWER_GATED_SENTINEL {
            return None;
        }
        match query {
            SystemQuery::NumQpus => Some(self.system_info(SystemInfo::QpuCount)),
            SystemQuery::TotalVpmMemoryBytes => Some(self.system_info(SystemInfo::VpmMemorySize)),
            _ => None,
        }
    }
}

impl QpuExecutor for V3d {
    fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle> {
        dispatch.validate()?;
        Ok(ExecutionHandle::resolved(self.execute(
            dispatch.control,
            dispatch.flush_cache,
            dispatch.timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v3d() -> (V3d, Arc<RegisterFile>) {
        let file = Arc::new(RegisterFile::new());
        (V3d::new(file.clone()), file)
    }

    #[test]
    fn decodes_identification() {
        let (v3d, _) = v3d();
        assert_eq!(v3d.system_info(SystemInfo::VpmMemorySize), 12 * 1024);
        assert_eq!(v3d.system_info(SystemInfo::VpmUserMemorySize), 4096);
        assert_eq!(v3d.system_info(SystemInfo::SemaphoreCount), 16);
        assert_eq!(v3d.system_info(SystemInfo::TmuPerSlice), 2);
        assert_eq!(v3d.system_info(SystemInfo::QpuPerSlice), 4);
        assert_eq!(v3d.system_info(SystemInfo::SliceCount), 3);
        assert_eq!(v3d.system_info(SystemInfo::QpuCount), 12);
        assert_eq!(v3d.system_info(SystemInfo::HdrSupport), 0);
        assert_eq!(v3d.system_info(SystemInfo::V3dRevision), 1);
        assert_eq!(v3d.technology_version(), 2);
    }

    #[test]
    fn vpm_size_zero_means_16k() {
        let (v3d, file) = v3d();
        file.set(V3D_IDENT1, 0);
        assert_eq!(v3d.system_info(SystemInfo::VpmMemorySize), 16 * 1024);
        assert_eq!(v3d.system_info(SystemInfo::QpuCount), FALLBACK_QPU_COUNT);
    }

    #[test]
    fn decodes_queue_status() {
        let (v3d, file) = v3d();
        file.set(V3D_SRQCS, (7 << 16) | (9 << 8) | (1 << 7) | 5);
        assert_eq!(v3d.system_info(SystemInfo::UserProgramsCompleted), 7);
        assert_eq!(v3d.system_info(SystemInfo::UserProgramsRequested), 9);
        assert_eq!(v3d.system_info(SystemInfo::UserProgramQueueFull), 1);
        assert_eq!(v3d.system_info(SystemInfo::UserProgramQueueLength), 5);
    }

    #[test]
    fn reservations_are_packed_per_qpu() {
        let (v3d, file) = v3d();
        v3d.set_reservation(1, QpuReservation::NO_USER_PROGRAMS).unwrap();
        v3d.set_reservation(9, QpuReservation::NO_VERTEX_SHADERS | QpuReservation::NO_FRAGMENT_SHADERS)
            .unwrap();
        assert_eq!(file.get(V3D_SQRSV0), 0x10);
        assert_eq!(file.get(V3D_SQRSV1), 0x60);
        assert_eq!(v3d.reservation(1).unwrap(), QpuReservation::NO_USER_PROGRAMS);
        assert_eq!(v3d.reservation(0).unwrap(), QpuReservation::ALLOW_ALL);

        v3d.set_reservation(1, QpuReservation::ALLOW_ALL).unwrap();
        assert_eq!(file.get(V3D_SQRSV0), 0);
        assert!(v3d.set_reservation(16, QpuReservation::ALLOW_ALL).is_err());
    }

    #[test]
    fn errors_are_read_and_cleared() {
        let (v3d, file) = v3d();
        file.set(V3D_ERRSTAT, (1 << 12) | (1 << 4));
        assert!(!v3d.has_error(V3dErrors::VPM_READ_RANGE));
        assert!(v3d.has_error(V3dErrors::VPM_WRITE_RANGE));
        assert!(!v3d.has_error(V3dErrors::VPM_WRITE_RANGE));
        assert_eq!(v3d.take_errors(), V3dErrors::VCD_IDLE);
        assert!(v3d.take_errors().is_empty());
    }
}
