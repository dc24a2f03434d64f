//! Access to the V3D register block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use memmap2::MmapRaw;

use super::regs::*;
use crate::error::HalResult;
use crate::memory::map_physical;

/// 32-bit register access at byte offsets into the V3D block.
///
/// Accesses are not serialized: read-modify-write sequences need external synchronization.
pub trait RegisterBlock: Send + Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);

    /// Replaces the bits selected by `mask` with the corresponding bits of `value`.
    fn write_masked(&self, offset: u32, mask: u32, value: u32) {
        let old = self.read(offset);
        self.write(offset, (old & !mask) | (value & mask));
    }
}

/// The real register block, mapped through `/dev/mem`.
pub struct MappedRegisters {
    map: MmapRaw,
}

impl MappedRegisters {
    /// Maps the V3D block of a SoC whose peripherals start at `peripheral_base`.
    pub fn map(peripheral_base: u32) -> HalResult<Self> {
        let base = peripheral_base.wrapping_add(V3D_OFFSET);
        let map = map_physical(base, V3D_LENGTH)?;
        tracing::debug!(base = format_args!("{base:#010x}"), "mapped V3D registers");
        Ok(Self { map })
    }

    fn register(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > self.map.len() {
            debug_assert!(false, "V3D register offset {offset:#x} out of range");
            return None;
        }
        // SAFETY: bounds checked above; the mapping start is page aligned so the register is
        // 4-byte aligned.
        Some(unsafe { self.map.as_mut_ptr().add(offset) }.cast::<u32>())
    }
}

impl RegisterBlock for MappedRegisters {
    fn read(&self, offset: u32) -> u32 {
        match self.register(offset) {
            // SAFETY: `register` only returns pointers into the live mapping.
            Some(reg) => unsafe { reg.read_volatile() },
            None => 0,
        }
    }

    fn write(&self, offset: u32, value: u32) {
        if let Some(reg) = self.register(offset) {
            // SAFETY: as above.
            unsafe { reg.write_volatile(value) }
        }
    }
}

/// An in-memory V3D register block.
///
/// Models the side effects the backend relies on: the write-1-to-clear fields of `SRQCS` and
/// `ERRSTAT`, counter clearing through `PCTRC`, the request counter advanced by `SRQPC` writes
/// and power gating. Programs "complete" immediately when auto-completion is on, otherwise only
/// through [`RegisterFile::complete_programs`].
pub struct RegisterFile {
    regs: Mutex<Vec<u32>>,
    auto_complete: AtomicBool,
    power_gated: AtomicBool,
}

impl RegisterFile {
    /// A VideoCore IV: 3 slices of 4 QPUs, 2 TMUs per slice, 12 KiB VPM with 4 KiB reserved for
    /// user programs, 16 semaphores, revision 1.
    pub fn new() -> Self {
        let file = Self {
            regs: Mutex::new(vec![0; V3D_LENGTH / 4]),
            auto_complete: AtomicBool::new(false),
            power_gated: AtomicBool::new(false),
        };
        file.set(V3D_IDENT0, (2 << IDENT0_TVER_SHIFT) | IDENT0_ID);
        file.set(
            V3D_IDENT1,
            (12 << IDENT1_VPMSZ_SHIFT)
                | (16 << IDENT1_NSEM_SHIFT)
                | (2 << IDENT1_TUPS_SHIFT)
                | (4 << IDENT1_QUPS_SHIFT)
                | (3 << IDENT1_NSLC_SHIFT)
                | 1,
        );
        file.set(V3D_VPMBASE, 16);
        file
    }

    /// Raw store, bypassing write side effects.
    pub fn set(&self, offset: u32, value: u32) {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)[(offset / 4) as usize] = value;
    }

    /// Raw load, ignoring power gating.
    pub fn get(&self, offset: u32) -> u32 {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)[(offset / 4) as usize]
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    pub fn set_power_gated(&self, gated: bool) {
        self.power_gated.store(gated, Ordering::SeqCst);
    }

    /// Marks `count` more user programs as completed.
    pub fn complete_programs(&self, count: u32) {
        let mut regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner);
        let srqcs = &mut regs[(V3D_SRQCS / 4) as usize];
        *srqcs = add_count(*srqcs, SRQCS_COMPLETED_SHIFT, count);
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

fn add_count(reg: u32, shift: u32, count: u32) -> u32 {
    let field = ((reg >> shift) & SRQCS_COUNT_MASK).wrapping_add(count) & SRQCS_COUNT_MASK;
    (reg & !(SRQCS_COUNT_MASK << shift)) | (field << shift)
}

impl RegisterBlock for RegisterFile {
    fn read(&self, offset: u32) -> u32 {
        if self.power_gated.load(Ordering::SeqCst) {
            return POWER_GATED_SENTINEL;
        }
        self.get(offset)
    }

    fn write(&self, offset: u32, value: u32) {
        let mut regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner);
        match offset {
            V3D_SRQCS => {
                let reg = &mut regs[(V3D_SRQCS / 4) as usize];
                if value & SRQCS_QERROR != 0 {
                    *reg &= !SRQCS_QERROR;
                }
                if value & SRQCS_CLEAR_REQUESTS != 0 {
                    *reg &= !(SRQCS_COUNT_MASK << SRQCS_REQUESTS_SHIFT);
                }
                if value & SRQCS_CLEAR_COMPLETED != 0 {
                    *reg &= !(SRQCS_COUNT_MASK << SRQCS_COMPLETED_SHIFT);
                }
            }
            V3D_SRQPC => {
                regs[(V3D_SRQPC / 4) as usize] = value;
                let reg = &mut regs[(V3D_SRQCS / 4) as usize];
                *reg = add_count(*reg, SRQCS_REQUESTS_SHIFT, 1);
                if self.auto_complete.load(Ordering::SeqCst) {
                    *reg = add_count(*reg, SRQCS_COMPLETED_SHIFT, 1);
                }
            }
            V3D_ERRSTAT => regs[(V3D_ERRSTAT / 4) as usize] &= !value,
            V3D_PCTRC => {
                for index in 0..COUNTER_COUNT {
                    if value & (1 << index) != 0 {
                        regs[(counter_value(index) / 4) as usize] = 0;
                    }
                }
            }
            _ => regs[(offset / 4) as usize] = value,
        }
    }
}
