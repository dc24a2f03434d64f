//! Kernel execution through the firmware GPU service (VCHI).
//!
//! Submission returns immediately; the firmware invokes a callback once the job finished. Only the
//! most recently submitted job is tracked: a completion for an older job (one whose wait already
//! timed out) is ignored.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::backend::{QpuExecutor, SystemQueries, SystemQuery};
use crate::error::{HalError, HalResult};
use crate::execution::{ExecutionHandle, QpuDispatch, MAX_QPUS};
use crate::userland::{VchiApi, VchiConnection, VchiInstance};

/// Slack the firmware gets on top of the kernel timeout before a wait gives up.
pub const FIRMWARE_GRACE: Duration = Duration::from_secs(1);

const GENCMD_RESPONSE_LEN: usize = 1024;

pub mod ffi {
    use std::ffi::{c_int, c_void};

    use crate::execution::MAX_QPUS;

    pub const EXECUTE_QPU: u32 = 2;

    /// `struct qpu_job_s`
    #[repr(C)]
    #[derive(Debug, Copy, Clone, Default)]
    pub struct QpuJobBody {
        pub jobs: u32,
        pub noflush: u32,
        pub timeout: u32,
        pub dummy: u32,
        pub control: [[u32; 2]; MAX_QPUS],
    }

    /// `struct gpu_callback_s`
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct GpuCallback {
        pub func: Option<unsafe extern "C" fn(*mut c_void)>,
        pub cookie: *mut c_void,
    }

    /// `struct gpu_internal_s`
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct GpuInternal {
        pub message: *mut c_void,
        pub refcount: c_int,
    }

    /// `struct gpu_job_s`. The job union is as large as `struct sync_job_s` (28 words), which is
    /// exactly the size of [`QpuJobBody`].
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct GpuJob {
        pub command: u32,
        pub body: QpuJobBody,
        pub callback: GpuCallback,
        pub internal: GpuInternal,
    }

    const _: () = assert!(std::mem::size_of::<QpuJobBody>() == 28 * 4);
}

/// A QPU job as handed to a [`GpuService`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QpuJob {
    pub jobs: u32,
    pub no_flush: bool,
    pub timeout_ms: u32,
    pub control: [[u32; 2]; MAX_QPUS],
}

#[derive(Debug, Default)]
struct TrackerState {
    current: u64,
    completed: u64,
}

/// Completion signal shared between the submitting thread, the firmware callback and waiters.
#[derive(Debug, Default)]
pub struct JobTracker {
    state: Mutex<TrackerState>,
    signal: Condvar,
}

impl JobTracker {
    fn begin(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.current += 1;
        state.current
    }

    fn complete(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.current != id {
            tracing::debug!(id, current = state.current, "ignoring completion of a stale job");
            return;
        }
        state.completed = id;
        self.signal.notify_all();
    }

    fn wait(&self, id: u64, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.completed == id {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(id, "timed out waiting for VCHI job");
                return false;
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Handed to the service with every submission; must be notified when the job finished.
#[derive(Debug)]
pub struct JobNotifier {
    id: u64,
    tracker: Arc<JobTracker>,
}

impl JobNotifier {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn notify(self) {
        self.tracker.complete(self.id);
    }
}

/// The firmware services the VCHI backend talks to.
pub trait GpuService: Send + Sync {
    /// Submits `job`. Returns `false` if the firmware rejected it, in which case `notifier` is
    /// dropped unsignalled.
    fn execute_qpu(&self, job: &QpuJob, notifier: JobNotifier) -> bool;

    /// Runs a general command (`vcgencmd`) and returns its textual response.
    fn gencmd(&self, command: &str) -> Option<String>;
}

/// [`GpuService`] backed by `libbcm_host.so`.
pub struct BcmHostGpuService {
    api: VchiApi,
    instance: VchiInstance,
}

// SAFETY: the VCHI instance is an opaque handle the userland library synchronizes internally.
unsafe impl Send for BcmHostGpuService {}
// SAFETY: see above.
unsafe impl Sync for BcmHostGpuService {}

extern "C" fn job_completed(cookie: *mut c_void) {
    // SAFETY: `cookie` is the boxed notifier leaked in `execute_qpu`, and the firmware calls
    // back exactly once per accepted job.
    let notifier = unsafe { Box::from_raw(cookie.cast::<JobNotifier>()) };
    notifier.notify();
}

impl BcmHostGpuService {
    pub fn connect() -> HalResult<Self> {
        let api = VchiApi::load()?;
        let mut instance: VchiInstance = ptr::null_mut();
        // SAFETY: calls follow the initialisation order documented in vchi.h.
        unsafe {
            let status = (api.vchi_initialise)(&mut instance);
            if status != 0 {
                return Err(HalError::Firmware {
                    call: "vchi_initialise",
                    status,
                });
            }
            let status = (api.vchi_connect)(ptr::null_mut(), 0, instance);
            if status != 0 {
                return Err(HalError::Firmware {
                    call: "vchi_connect",
                    status,
                });
            }
            let status = (api.vc_gpuserv_init)();
            if status != 0 {
                (api.vchi_disconnect)(instance);
                return Err(HalError::Firmware {
                    call: "vc_gpuserv_init",
                    status,
                });
            }
            let mut connection: *mut VchiConnection = ptr::null_mut();
            (api.vc_vchi_gencmd_init)(instance, &mut connection, 1);
        }
        tracing::debug!("connected to the VCHI GPU service");
        Ok(Self { api, instance })
    }
}

impl Drop for BcmHostGpuService {
    fn drop(&mut self) {
        // SAFETY: reverse of the initialisation in `connect`.
        unsafe {
            (self.api.vc_gencmd_stop)();
            (self.api.vc_gpuserv_deinit)();
            (self.api.vchi_disconnect)(self.instance);
        }
    }
}

impl GpuService for BcmHostGpuService {
    fn execute_qpu(&self, job: &QpuJob, notifier: JobNotifier) -> bool {
        let cookie = Box::into_raw(Box::new(notifier));
        let mut gpu_job = ffi::GpuJob {
            command: ffi::EXECUTE_QPU,
            body: ffi::QpuJobBody {
                jobs: job.jobs,
                noflush: u32::from(job.no_flush),
                timeout: job.timeout_ms,
                dummy: 0,
                control: job.control,
            },
            callback: ffi::GpuCallback {
                func: Some(job_completed as unsafe extern "C" fn(*mut c_void)),
                cookie: cookie.cast::<c_void>(),
            },
            internal: ffi::GpuInternal {
                message: ptr::null_mut(),
                refcount: 0,
            },
        };
        // SAFETY: the job is copied by the service before the call returns.
        let status = unsafe { (self.api.vc_gpuserv_execute_code)(1, &mut gpu_job) };
        if status != 0 {
            tracing::debug!(status, "GPU service rejected QPU job");
            // SAFETY: the firmware did not take the job, so the callback never runs.
            drop(unsafe { Box::from_raw(cookie) });
            return false;
        }
        true
    }

    fn gencmd(&self, command: &str) -> Option<String> {
        let command = CString::new(command).ok()?;
        let mut response = [0 as c_char; GENCMD_RESPONSE_LEN];
        // SAFETY: the response buffer length is passed along; the command is passed as an
        // argument to "%s" so it is never interpreted as a format string.
        let status = unsafe {
            (self.api.vc_gencmd)(
                response.as_mut_ptr(),
                GENCMD_RESPONSE_LEN as c_int,
                b"%s\0".as_ptr().cast::<c_char>(),
                command.as_ptr(),
            )
        };
        if status != 0 {
            return None;
        }
        response[GENCMD_RESPONSE_LEN - 1] = 0;
        // SAFETY: NUL terminated above.
        let text = unsafe { CStr::from_ptr(response.as_ptr()) };
        Some(text.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GencmdUnit {
    Hertz,
    Megahertz,
    /// Memory size with a `M`/`G` suffix.
    MemorySize,
    Celsius,
}

/// The general command answering `query`, if any.
fn gencmd_for(query: SystemQuery) -> Option<(&'static str, GencmdUnit)> {
    match query {
        SystemQuery::CurrentQpuClockRateHz => Some(("measure_clock v3d", GencmdUnit::Hertz)),
        SystemQuery::MaximumQpuClockRateHz => Some(("get_config gpu_freq", GencmdUnit::Megahertz)),
        SystemQuery::CurrentArmClockRateHz => Some(("measure_clock arm", GencmdUnit::Hertz)),
        SystemQuery::MaximumArmClockRateHz => Some(("get_config arm_freq", GencmdUnit::Megahertz)),
        SystemQuery::QpuTemperatureMilliDegrees => Some(("measure_temp", GencmdUnit::Celsius)),
        SystemQuery::TotalArmMemoryBytes => Some(("get_mem arm", GencmdUnit::MemorySize)),
        SystemQuery::TotalGpuMemoryBytes => Some(("get_mem gpu", GencmdUnit::MemorySize)),
        SystemQuery::TotalVpmMemoryBytes | SystemQuery::NumQpus => None,
    }
}

/// Converts a `key=value` general command response to the unit of `query`.
pub fn parse_gencmd_response(query: SystemQuery, response: &str) -> Option<u32> {
    let (_, unit) = gencmd_for(query)?;
    let (_, value) = response.trim().split_once('=')?;
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(end);

    let scaled = match unit {
        GencmdUnit::Hertz => number.parse::<u64>().ok()?,
        GencmdUnit::Megahertz => number.parse::<u64>().ok()?.checked_mul(1_000_000)?,
        GencmdUnit::MemorySize => {
            let shift = match suffix.chars().next() {
                Some('G') => 30,
                Some('M') => 20,
                Some('K') => 10,
                _ => 0,
            };
            number.parse::<u64>().ok()?.checked_shl(shift)?
        }
        GencmdUnit::Celsius => (number.parse::<f64>().ok()? * 1000.0).round() as u64,
    };
    u32::try_from(scaled).ok()
}

/// VCHI execution backend.
pub struct Vchi {
    service: Box<dyn GpuService>,
    tracker: Arc<JobTracker>,
}

impl Vchi {
    pub fn connect() -> HalResult<Self> {
        Ok(Self::new(Box::new(BcmHostGpuService::connect()?)))
    }

    pub fn new(service: Box<dyn GpuService>) -> Self {
        Self {
            service,
            tracker: Arc::default(),
        }
    }

    /// Raw general command access.
    pub fn gencmd(&self, command: &str) -> Option<String> {
        self.service.gencmd(command)
    }
}

impl SystemQueries for Vchi {
    fn read_value(&self, query: SystemQuery) -> Option<u32> {
        let (command, _) = gencmd_for(query)?;
        let response = self.service.gencmd(command)?;
        let value = parse_gencmd_response(query, &response);
        if value.is_none() {
            tracing::debug!(command, %response, "unexpected general command response");
        }
        value
    }
}

impl QpuExecutor for Vchi {
    fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle> {
        dispatch.validate()?;
        let Some(timeout_ms) = dispatch.timeout_ms() else {
            tracing::warn!(timeout = ?dispatch.timeout, "execution timeout does not fit the GPU service");
            return Ok(ExecutionHandle::failed());
        };

        let mut control = [[0u32; 2]; MAX_QPUS];
        control[..dispatch.control.len()].copy_from_slice(dispatch.control);
        let job = QpuJob {
            jobs: dispatch.num_qpus(),
            no_flush: !dispatch.flush_cache,
            timeout_ms,
            control,
        };

        let submitted = Instant::now();
        let id = self.tracker.begin();
        let notifier = JobNotifier {
            id,
            tracker: self.tracker.clone(),
        };
        if !self.service.execute_qpu(&job, notifier) {
            return Ok(ExecutionHandle::failed());
        }

        let deadline = submitted + dispatch.timeout + FIRMWARE_GRACE;
        let tracker = self.tracker.clone();
        Ok(ExecutionHandle::pending(move || tracker.wait(id, deadline)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clock_responses() {
        assert_eq!(
            parse_gencmd_response(SystemQuery::MaximumQpuClockRateHz, "gpu_freq=300"),
            Some(300_000_000)
        );
        assert_eq!(
            parse_gencmd_response(SystemQuery::CurrentQpuClockRateHz, "frequency(46)=250000496"),
            Some(250_000_496)
        );
        assert_eq!(
            parse_gencmd_response(SystemQuery::CurrentArmClockRateHz, "frequency(48)=600117184\n"),
            Some(600_117_184)
        );
    }

    #[test]
    fn parses_memory_and_temperature() {
        assert_eq!(
            parse_gencmd_response(SystemQuery::TotalGpuMemoryBytes, "gpu=128M"),
            Some(128 * 1024 * 1024)
        );
        assert_eq!(
            parse_gencmd_response(SystemQuery::TotalArmMemoryBytes, "arm=1G"),
            Some(1 << 30)
        );
        assert_eq!(
            parse_gencmd_response(SystemQuery::QpuTemperatureMilliDegrees, "temp=39.2'C"),
            Some(39_200)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_gencmd_response(SystemQuery::TotalGpuMemoryBytes, "no value"), None);
        assert_eq!(parse_gencmd_response(SystemQuery::NumQpus, "qpus=12"), None);
        assert_eq!(parse_gencmd_response(SystemQuery::MaximumQpuClockRateHz, "gpu_freq=99999"), None);
    }

    #[test]
    fn stale_completions_are_ignored() {
        let tracker = JobTracker::default();
        let first = tracker.begin();
        let second = tracker.begin();
        tracker.complete(first);
        assert!(!tracker.wait(second, Instant::now()));
        tracker.complete(second);
        assert!(tracker.wait(second, Instant::now()));
    }
}
