//! Hardware access layer for the VideoCore IV GPU of the BCM2835/6/7.
//!
//! The GPU is reached through several independent paths, each wrapped by its own backend:
//! - [`mailbox`]: firmware property calls over `/dev/vcio` (allocation, queries, execution),
//! - [`v3d`]: the memory-mapped V3D registers (execution, performance counters),
//! - [`vcsm`]: the VideoCore shared memory allocator from the userland libraries,
//! - [`vchi`]: asynchronous kernel execution through the GPU service,
//! - [`emulator`]: an in-process stand-in used for testing and on machines without the GPU.
//!
//! [`SystemAccess`] selects one memory backend and one execution backend according to a
//! [`HalConfig`] and answers system queries from every backend it opened. [`system()`] gives the
//! process-wide instance configured from the environment.

pub mod backend;
pub mod board;
pub mod config;
pub mod emulator;
pub mod error;
pub mod execution;
pub mod mailbox;
pub mod memory;
pub mod system;
pub mod userland;
pub mod v3d;
pub mod vchi;
pub mod vcsm;

pub use backend::{DeviceMemory, QpuExecutor, SystemQueries, SystemQuery};
pub use board::BoardInfo;
pub use config::{ExecutionMode, HalConfig, MemoryMode};
pub use emulator::{EmulationRequest, Emulator, GpuRegion, NoQpuEmulator, QpuEmulator};
pub use error::{HalError, HalResult};
pub use execution::{ExecutionHandle, ExecutionState, QpuDispatch, MAX_QPUS, MAX_TIMEOUT};
pub use mailbox::Mailbox;
pub use memory::{BufferRequest, CacheType, DeviceBuffer, DevicePointer, PAGE_ALIGNMENT};
pub use system::{system, Backends, ExecutionBackend, MemoryBackend, SystemAccess};
pub use v3d::V3d;
pub use vchi::Vchi;
pub use vcsm::Vcsm;
