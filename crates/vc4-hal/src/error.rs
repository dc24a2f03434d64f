use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the hardware-access layer.
pub type HalResult<T> = Result<T, HalError>;

/// Errors surfaced by the hardware-access layer.
///
/// A well-formed "no" from the hardware (allocation exhausted, execution timed out) is *not* an
/// error: those are reported as `Ok(None)`, `Ok(false)` or a failed
/// [`ExecutionHandle`](crate::ExecutionHandle). `HalError` covers broken system resources
/// ([`HalError::is_fatal`]) and caller-contract violations that are rejected before any hardware
/// is touched.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("failed to open {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {len:#x} bytes of physical memory at {address:#010x}: {source}")]
    Map {
        address: u32,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("mailbox ioctl for tag {tag:#x} failed: {source}")]
    Transport {
        tag: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to load {library}: {source}")]
    Library {
        library: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("firmware call {call} failed with status {status}")]
    Firmware { call: &'static str, status: i32 },

    #[error("{0} is not supported by this backend configuration")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("performance counter index {index} out of range (max {max})")]
    CounterIndexOutOfRange { index: u8, max: u8 },

    #[error("QPU index {index} out of range (max {max})")]
    QpuIndexOutOfRange { index: u8, max: u8 },

    #[error("performance counter {index} is not readable (V3D power-gated)")]
    CounterPowerGated { index: u8 },
}

impl HalError {
    /// Returns `true` if the error indicates a broken system resource (driver file, mapping,
    /// userland library, transport). The device should be considered unusable afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HalError::DeviceOpen { .. }
                | HalError::Map { .. }
                | HalError::Transport { .. }
                | HalError::Library { .. }
                | HalError::Firmware { .. }
        )
    }
}
