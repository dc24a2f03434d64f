//! Capability traits implemented by the hardware-access backends.
//!
//! [`SystemAccess`](crate::SystemAccess) composes exactly one [`DeviceMemory`] and one
//! [`QpuExecutor`] plus every backend that can answer [`SystemQueries`]. Keeping these as separate
//! traits lets a backend implement only what it actually supports (the V3D register block cannot
//! allocate memory, the VCSM allocator cannot execute kernels).

use std::sync::Arc;

use crate::error::HalResult;
use crate::execution::{ExecutionHandle, QpuDispatch};
use crate::memory::{BufferRelease, BufferRequest, DeviceBuffer};

/// Scalar values a backend may be able to report.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SystemQuery {
    CurrentQpuClockRateHz,
    MaximumQpuClockRateHz,
    CurrentArmClockRateHz,
    MaximumArmClockRateHz,
    QpuTemperatureMilliDegrees,
    TotalArmMemoryBytes,
    TotalGpuMemoryBytes,
    TotalVpmMemoryBytes,
    NumQpus,
}

impl SystemQuery {
    pub const ALL: [SystemQuery; 9] = [
        SystemQuery::CurrentQpuClockRateHz,
        SystemQuery::MaximumQpuClockRateHz,
        SystemQuery::CurrentArmClockRateHz,
        SystemQuery::MaximumArmClockRateHz,
        SystemQuery::QpuTemperatureMilliDegrees,
        SystemQuery::TotalArmMemoryBytes,
        SystemQuery::TotalGpuMemoryBytes,
        SystemQuery::TotalVpmMemoryBytes,
        SystemQuery::NumQpus,
    ];
}

pub trait SystemQueries: Send + Sync {
    /// Returns `None` if this backend cannot answer `query`.
    fn read_value(&self, query: SystemQuery) -> Option<u32>;
}

pub trait DeviceMemory: Send + Sync {
    /// Allocates a buffer owned by this backend.
    ///
    /// `Ok(None)` means the backend refused (out of memory, table full); `Err` means the backend
    /// itself is broken.
    fn allocate_buffer(self: Arc<Self>, request: &BufferRequest<'_>)
        -> HalResult<Option<DeviceBuffer>>;

    /// Gives an allocation back. Called exactly once per buffer, by the buffer itself.
    fn deallocate(&self, release: BufferRelease) -> HalResult<bool>;
}

pub trait QpuExecutor: Send + Sync {
    fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle>;
}
