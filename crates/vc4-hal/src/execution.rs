//! Kernel dispatch parameters and the completion handle returned by every executor.

use std::fmt;
use std::time::Duration;

use crate::error::{HalError, HalResult};
use crate::memory::DevicePointer;

/// Number of QPUs on the VideoCore IV, and the most a single dispatch can use.
pub const MAX_QPUS: usize = 12;

/// Largest timeout that still fits the 32-bit millisecond field used by the firmware.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(u32::MAX as u64);

/// One kernel dispatch.
///
/// `control` holds one `[uniforms address, start PC]` pair per QPU. The same pairs must also be
/// present in device memory at `control_address`: the firmware based executors read them from
/// there, the register backend writes them straight into the dispatch registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpuDispatch<'a> {
    pub control: &'a [[u32; 2]],
    pub control_address: DevicePointer,
    pub flush_cache: bool,
    pub timeout: Duration,
}

impl QpuDispatch<'_> {
    pub fn num_qpus(&self) -> u32 {
        self.control.len() as u32
    }

    pub(crate) fn validate(&self) -> HalResult<()> {
        if self.control.is_empty() || self.control.len() > MAX_QPUS {
            return Err(HalError::InvalidArgument(format!(
                "cannot dispatch to {} QPUs (1..={MAX_QPUS})",
                self.control.len()
            )));
        }
        Ok(())
    }

    /// Timeout in whole milliseconds, or `None` if it cannot be sent to the firmware.
    pub(crate) fn timeout_ms(&self) -> Option<u32> {
        u32::try_from(self.timeout.as_millis()).ok()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Passed,
    Failed,
}

type CompletionCheck = Box<dyn FnOnce() -> bool + Send>;

/// Outcome of a kernel dispatch.
///
/// Backends that block until the kernel finished return an already resolved handle. The VCHI
/// backend returns a pending one whose check blocks on the job's completion signal. The check runs
/// at most once; its result is cached for every later [`wait`](ExecutionHandle::wait).
#[must_use = "an ExecutionHandle must be waited on to learn whether the kernel ran"]
pub struct ExecutionHandle {
    state: ExecutionState,
    check: Option<CompletionCheck>,
}

impl ExecutionHandle {
    pub fn resolved(passed: bool) -> Self {
        Self {
            state: if passed {
                ExecutionState::Passed
            } else {
                ExecutionState::Failed
            },
            check: None,
        }
    }

    pub fn passed() -> Self {
        Self::resolved(true)
    }

    pub fn failed() -> Self {
        Self::resolved(false)
    }

    pub fn pending(check: impl FnOnce() -> bool + Send + 'static) -> Self {
        Self {
            state: ExecutionState::Pending,
            check: Some(Box::new(check)),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Blocks until the dispatch finished, returning whether it succeeded.
    pub fn wait(&mut self) -> bool {
        if let Some(check) = self.check.take() {
            self.state = if check() {
                ExecutionState::Passed
            } else {
                ExecutionState::Failed
            };
        }
        self.state == ExecutionState::Passed
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolved_handles_never_change() {
        let mut passed = ExecutionHandle::passed();
        assert_eq!(passed.state(), ExecutionState::Passed);
        assert!(passed.wait());
        assert!(passed.wait());

        let mut failed = ExecutionHandle::failed();
        assert!(!failed.wait());
        assert_eq!(failed.state(), ExecutionState::Failed);
    }

    #[test]
    fn pending_check_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handle = ExecutionHandle::pending(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert_eq!(handle.state(), ExecutionState::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(handle.wait());
        assert!(handle.wait());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ExecutionState::Passed);
    }

    #[test]
    fn dispatch_validation() {
        let control = [[0u32; 2]; MAX_QPUS + 1];
        let too_many = QpuDispatch {
            control: &control,
            control_address: DevicePointer::new(0x1000),
            flush_cache: true,
            timeout: Duration::from_secs(1),
        };
        assert!(too_many.validate().is_err());

        let none = QpuDispatch {
            control: &[],
            ..too_many
        };
        assert!(none.validate().is_err());

        let ok = QpuDispatch {
            control: &control[..4],
            ..too_many
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.num_qpus(), 4);
        assert_eq!(ok.timeout_ms(), Some(1000));

        let huge = QpuDispatch {
            timeout: MAX_TIMEOUT + Duration::from_millis(1),
            ..ok
        };
        assert_eq!(huge.timeout_ms(), None);
    }
}
