//! V3D register layout and bit definitions (VideoCore IV 3D architecture reference guide).
//!
//! Offsets are in bytes from the start of the V3D block.

/// Offset of the V3D block from the peripheral base.
pub const V3D_OFFSET: u32 = 0x00C0_0000;
/// Bytes to map: everything up to and including `ERRSTAT`, plus some slack.
pub const V3D_LENGTH: usize = ((V3D_ERRSTAT as usize / 4) + 16) * 4;

pub const V3D_IDENT0: u32 = 0x000;
pub const V3D_IDENT1: u32 = 0x004;
pub const V3D_IDENT2: u32 = 0x008;
pub const V3D_SCRATCH: u32 = 0x010;
pub const V3D_L2CACTL: u32 = 0x020;
pub const V3D_SLCACTL: u32 = 0x024;

pub const V3D_SQRSV0: u32 = 0x410;
pub const V3D_SQRSV1: u32 = 0x414;
pub const V3D_SRQPC: u32 = 0x430;
pub const V3D_SRQUA: u32 = 0x434;
pub const V3D_SRQUL: u32 = 0x438;
pub const V3D_SRQCS: u32 = 0x43C;

pub const V3D_VPMBASE: u32 = 0x504;

pub const V3D_PCTRC: u32 = 0x670;
pub const V3D_PCTRE: u32 = 0x674;
pub const V3D_PCTR0: u32 = 0x680;
pub const V3D_PCTRS0: u32 = 0x684;
/// Distance between two counters' `PCTR`/`PCTRS` pairs.
pub const V3D_PCTR_STRIDE: u32 = 0x8;

pub const V3D_ERRSTAT: u32 = 0xF20;

/// Value read from any V3D register while the block is power-gated.
pub const POWER_GATED_SENTINEL: u32 = 0xDEAD_BEEF;

// IDENT0: bits 24..31 technology version, bits 0..23 the ASCII id "V3D".
pub const IDENT0_TVER_SHIFT: u32 = 24;
pub const IDENT0_ID_MASK: u32 = 0x00FF_FFFF;
pub const IDENT0_ID: u32 = u32::from_le_bytes([b'V', b'3', b'D', 0]);

// IDENT1 fields.
pub const IDENT1_VPMSZ_SHIFT: u32 = 28;
pub const IDENT1_HDRT_SHIFT: u32 = 24;
pub const IDENT1_NSEM_SHIFT: u32 = 16;
pub const IDENT1_TUPS_SHIFT: u32 = 12;
pub const IDENT1_QUPS_SHIFT: u32 = 8;
pub const IDENT1_NSLC_SHIFT: u32 = 4;
pub const IDENT1_REVR_MASK: u32 = 0xF;

// VPMBASE: VPM memory reserved for user programs, in units of 256 bytes.
pub const VPMBASE_VPMURSV_MASK: u32 = 0x1F;
pub const VPMBASE_UNIT_BYTES: u32 = 256;

pub const L2CACTL_L2CCLR: u32 = 1 << 2;
/// Clears every slice's instruction, uniform and TMU caches.
pub const SLCACTL_CLEAR_ALL: u32 = 0xFFFF_FFFF;

// SRQCS: user program request control and status.
pub const SRQCS_QLEN_MASK: u32 = 0x3F;
/// Queue error (write 1 to clear).
pub const SRQCS_QERROR: u32 = 1 << 7;
pub const SRQCS_QFULL_SHIFT: u32 = 7;
/// Count of user program requests (write 1 to bit 8 to clear).
pub const SRQCS_REQUESTS_SHIFT: u32 = 8;
/// Count of user programs completed (write 1 to bit 16 to clear).
pub const SRQCS_COMPLETED_SHIFT: u32 = 16;
pub const SRQCS_COUNT_MASK: u32 = 0xFF;
pub const SRQCS_CLEAR_REQUESTS: u32 = 1 << SRQCS_REQUESTS_SHIFT;
pub const SRQCS_CLEAR_COMPLETED: u32 = 1 << SRQCS_COMPLETED_SHIFT;

/// `PCTRE` bit that turns the counters on at all.
pub const PCTRE_ENABLE: u32 = 1 << 31;
pub const PCTRS_MASK: u32 = 0x1F;
/// Number of performance counters.
pub const COUNTER_COUNT: u8 = 16;

/// Bits per QPU in `SQRSV0`/`SQRSV1`.
pub const RESERVATION_BITS: u32 = 4;
pub const RESERVATION_MASK: u32 = 0xF;
pub const QPUS_PER_RESERVATION_REGISTER: u8 = 8;
/// Number of QPUs addressable by the reservation registers.
pub const RESERVATION_QPU_COUNT: u8 = 16;

/// Byte offset of counter `index`'s value register.
pub const fn counter_value(index: u8) -> u32 {
    V3D_PCTR0 + index as u32 * V3D_PCTR_STRIDE
}

/// Byte offset of counter `index`'s event mapping register.
pub const fn counter_mapping(index: u8) -> u32 {
    V3D_PCTRS0 + index as u32 * V3D_PCTR_STRIDE
}
