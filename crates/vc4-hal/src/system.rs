use std::sync::{Arc, OnceLock};

use crate::backend::{DeviceMemory, QpuExecutor, SystemQueries, SystemQuery};
use crate::board::BoardInfo;
use crate::config::{ExecutionMode, HalConfig, MemoryMode};
use crate::emulator::Emulator;
use crate::error::{HalError, HalResult};
use crate::execution::{ExecutionHandle, QpuDispatch};
use crate::mailbox::Mailbox;
use crate::memory::{BufferRequest, DeviceBuffer, PAGE_ALIGNMENT};
use crate::userland::BcmHost;
use crate::v3d::V3d;
use crate::vchi::Vchi;
use crate::vcsm::Vcsm;

/// QPU count reported when no backend knows better.
pub const DEFAULT_QPU_COUNT: u32 = 12;
/// VPM bytes usable by user programs: 64 rows of 16 words.
pub const DEFAULT_VPM_MEMORY: u32 = 64 * 16 * 4;

/// Every backend a [`SystemAccess`] may use. Missing entries are simply not consulted.
#[derive(Default)]
pub struct Backends {
    pub mailbox: Option<Arc<Mailbox>>,
    pub v3d: Option<Arc<V3d>>,
    pub vcsm: Option<Arc<Vcsm>>,
    pub vchi: Option<Arc<Vchi>>,
    pub emulator: Option<Arc<Emulator>>,
}

#[derive(Clone)]
pub enum MemoryBackend {
    Mailbox(Arc<Mailbox>),
    Vcsm(Arc<Vcsm>),
    Emulator(Arc<Emulator>),
    None,
}

impl MemoryBackend {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryBackend::Mailbox(_) => "mailbox",
            MemoryBackend::Vcsm(vcsm) if vcsm.uses_cma() => "vcsm-cma",
            MemoryBackend::Vcsm(_) => "vcsm",
            MemoryBackend::Emulator(_) => "emulator",
            MemoryBackend::None => "none",
        }
    }

    fn device_memory(&self) -> Option<Arc<dyn DeviceMemory>> {
        match self {
            MemoryBackend::Mailbox(mailbox) => Some(mailbox.clone()),
            MemoryBackend::Vcsm(vcsm) => Some(vcsm.clone()),
            MemoryBackend::Emulator(emulator) => Some(emulator.clone()),
            MemoryBackend::None => None,
        }
    }
}

#[derive(Clone)]
pub enum ExecutionBackend {
    V3d(Arc<V3d>),
    Mailbox(Arc<Mailbox>),
    Vchi(Arc<Vchi>),
    Emulator(Arc<Emulator>),
    None,
}

impl ExecutionBackend {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionBackend::V3d(_) => "v3d",
            ExecutionBackend::Mailbox(_) => "mailbox",
            ExecutionBackend::Vchi(_) => "vchi",
            ExecutionBackend::Emulator(_) => "emulator",
            ExecutionBackend::None => "none",
        }
    }

    fn executor(&self) -> Option<&dyn QpuExecutor> {
        match self {
            ExecutionBackend::V3d(v3d) => Some(v3d.as_ref()),
            ExecutionBackend::Mailbox(mailbox) => Some(mailbox.as_ref()),
            ExecutionBackend::Vchi(vchi) => Some(vchi.as_ref()),
            ExecutionBackend::Emulator(emulator) => Some(emulator.as_ref()),
            ExecutionBackend::None => None,
        }
    }
}

/// Entry point to the hardware: one memory backend, one execution backend and every backend
/// that can answer system queries, all chosen once at construction.
pub struct SystemAccess {
    config: HalConfig,
    backends: Backends,
    memory: MemoryBackend,
    execution: ExecutionBackend,
}

impl SystemAccess {
    /// Initialises the backends selected by `config`.
    ///
    /// Failing to initialise a backend the configuration depends on is fatal. Backends that are
    /// only used for queries are skipped when they are unavailable.
    pub fn new(config: HalConfig) -> HalResult<Self> {
        if config.emulated {
            let backends = Backends {
                emulator: Some(Arc::new(Emulator::default())),
                ..Backends::default()
            };
            return Ok(Self::from_backends(config, backends));
        }

        let mut backends = Backends::default();

        if config.activates_mailbox() {
            backends.mailbox = Some(Arc::new(Mailbox::open()?));
        }

        let needs_vcsm = matches!(config.memory, MemoryMode::Vcsm | MemoryMode::VcsmCma);
        if !config.disable_vcsm && needs_vcsm {
            let vcsm = Vcsm::open(config.memory == MemoryMode::VcsmCma)?;
            backends.vcsm = Some(Arc::new(vcsm));
        }

        let needs_v3d = config.execution == ExecutionMode::V3dRegisterPoking;
        if !config.disable_v3d && (needs_v3d || config.performance_counters) {
            match BcmHost::load().and_then(|host| V3d::open(host.peripheral_address())) {
                Ok(v3d) => backends.v3d = Some(Arc::new(v3d)),
                Err(err) if !needs_v3d => {
                    tracing::warn!(error = %err, "V3D registers unavailable, performance counters disabled");
                }
                Err(err) => return Err(err),
            }
        }

        if !config.disable_vchi && config.execution == ExecutionMode::Vchi {
            backends.vchi = Some(Arc::new(Vchi::connect()?));
        }

        Ok(Self::from_backends(config, backends))
    }

    /// Composes already initialised backends according to `config`.
    pub fn from_backends(config: HalConfig, backends: Backends) -> Self {
        let memory = if config.emulated {
            backends.emulator.clone().map(MemoryBackend::Emulator)
        } else {
            match config.memory {
                MemoryMode::Mailbox => backends.mailbox.clone().map(MemoryBackend::Mailbox),
                MemoryMode::Vcsm | MemoryMode::VcsmCma => {
                    backends.vcsm.clone().map(MemoryBackend::Vcsm)
                }
            }
        }
        .unwrap_or(MemoryBackend::None);

        let execution = if config.emulated {
            backends.emulator.clone().map(ExecutionBackend::Emulator)
        } else {
            match config.execution {
                ExecutionMode::V3dRegisterPoking => backends.v3d.clone().map(ExecutionBackend::V3d),
                ExecutionMode::Mailbox => backends.mailbox.clone().map(ExecutionBackend::Mailbox),
                ExecutionMode::Vchi => backends.vchi.clone().map(ExecutionBackend::Vchi),
            }
        }
        .unwrap_or(ExecutionBackend::None);

        if let Some(v3d) = &backends.v3d {
            v3d.set_poll_interval(config.v3d_poll_interval);
        }
        if matches!(memory, MemoryBackend::None) {
            tracing::warn!(mode = ?config.memory, "no memory backend available");
        }
        if matches!(execution, ExecutionBackend::None) {
            tracing::warn!(mode = ?config.execution, "no execution backend available");
        }
        tracing::debug!(
            memory = memory.name(),
            execution = execution.name(),
            emulated = config.emulated,
            "selected hardware backends"
        );

        Self {
            config,
            backends,
            memory,
            execution,
        }
    }

    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    pub fn is_emulated(&self) -> bool {
        self.config.emulated
    }

    pub fn memory_backend(&self) -> &MemoryBackend {
        &self.memory
    }

    pub fn execution_backend(&self) -> &ExecutionBackend {
        &self.execution
    }

    pub fn executes_kernels_via_v3d(&self) -> bool {
        matches!(self.execution, ExecutionBackend::V3d(_))
    }

    pub fn mailbox(&self) -> Option<&Arc<Mailbox>> {
        self.backends.mailbox.as_ref()
    }

    pub fn v3d(&self) -> Option<&Arc<V3d>> {
        self.backends.v3d.as_ref()
    }

    pub fn vcsm(&self) -> Option<&Arc<Vcsm>> {
        self.backends.vcsm.as_ref()
    }

    pub fn vchi(&self) -> Option<&Arc<Vchi>> {
        self.backends.vchi.as_ref()
    }

    pub fn emulator(&self) -> Option<&Arc<Emulator>> {
        self.backends.emulator.as_ref()
    }

    /// Asks the backends in order (emulator, VCSM, V3D, VCHI, mailbox) until one answers.
    pub fn query(&self, query: SystemQuery) -> Option<u32> {
        if self.config.emulated {
            return self.backends.emulator.as_ref()?.read_value(query);
        }
        let sources: [Option<&dyn SystemQueries>; 4] = [
            self.backends.vcsm.as_deref().map(|b| b as &dyn SystemQueries),
            self.backends.v3d.as_deref().map(|b| b as &dyn SystemQueries),
            self.backends.vchi.as_deref().map(|b| b as &dyn SystemQueries),
            self.backends.mailbox.as_deref().map(|b| b as &dyn SystemQueries),
        ];
        sources
            .into_iter()
            .flatten()
            .find_map(|source| source.read_value(query))
    }

    /// Like [`query`](Self::query), falling back to a fixed default.
    pub fn query_or_default(&self, query: SystemQuery) -> u32 {
        self.query(query).unwrap_or_else(|| default_value(query))
    }

    pub fn total_gpu_memory(&self) -> u32 {
        self.query_or_default(SystemQuery::TotalGpuMemoryBytes)
    }

    pub fn num_qpus(&self) -> u32 {
        self.query_or_default(SystemQuery::NumQpus)
    }

    pub fn qpu_clock_rate(&self) -> u32 {
        self.query_or_default(SystemQuery::CurrentQpuClockRateHz)
    }

    pub fn gpu_temperature(&self) -> u32 {
        self.query_or_default(SystemQuery::QpuTemperatureMilliDegrees)
    }

    pub fn total_vpm_memory(&self) -> u32 {
        self.query_or_default(SystemQuery::TotalVpmMemoryBytes)
    }

    /// Decoded board revision, if the mailbox is available.
    pub fn board_info(&self) -> Option<BoardInfo> {
        let revision = self.backends.mailbox.as_ref()?.board_revision().ok()??;
        Some(BoardInfo::decode(revision))
    }

    /// Allocates `size` bytes with the default cache policy.
    pub fn allocate_buffer(&self, size: u32, alignment: u32) -> HalResult<Option<DeviceBuffer>> {
        self.allocate(&BufferRequest::new(size).with_alignment(alignment))
    }

    /// Allocates a buffer from the memory backend. `Ok(None)` means the backend refused.
    pub fn allocate(&self, request: &BufferRequest<'_>) -> HalResult<Option<DeviceBuffer>> {
        request.validate()?;
        let Some(memory) = self.memory.device_memory() else {
            return Err(HalError::Unsupported("buffer allocation without a memory backend"));
        };
        let mut request = request.clone();
        if let Some(cache) = self.config.forced_cache {
            request.cache = cache;
        }
        if request.alignment < PAGE_ALIGNMENT {
            request.alignment = PAGE_ALIGNMENT;
        }
        memory.allocate_buffer(&request)
    }

    /// Releases `buffer` now instead of when it is dropped.
    pub fn deallocate_buffer(&self, buffer: DeviceBuffer) -> HalResult<bool> {
        buffer.release()
    }

    pub fn execute_qpu(&self, dispatch: &QpuDispatch<'_>) -> HalResult<ExecutionHandle> {
        dispatch.validate()?;
        let Some(executor) = self.execution.executor() else {
            return Err(HalError::Unsupported("kernel execution without an execution backend"));
        };
        tracing::trace!(
            backend = self.execution.name(),
            qpus = dispatch.num_qpus(),
            control = %dispatch.control_address,
            "dispatching kernel"
        );
        executor.execute_qpu(dispatch)
    }

    /// Writes host caches of `buffers` back to memory. Only VCSM buffers are cached on the host;
    /// for every other memory backend this is a no-op.
    pub fn flush_cpu_cache(&self, buffers: &[&DeviceBuffer]) -> bool {
        match &self.memory {
            MemoryBackend::Vcsm(vcsm) => vcsm.flush_cpu_cache(buffers),
            MemoryBackend::None => false,
            MemoryBackend::Mailbox(_) | MemoryBackend::Emulator(_) => true,
        }
    }
}

fn default_value(query: SystemQuery) -> u32 {
    match query {
        SystemQuery::NumQpus => DEFAULT_QPU_COUNT,
        SystemQuery::TotalVpmMemoryBytes => DEFAULT_VPM_MEMORY,
        _ => 0,
    }
}

static SYSTEM: OnceLock<HalResult<Arc<SystemAccess>>> = OnceLock::new();

/// The process-wide [`SystemAccess`], built from the environment on first use.
pub fn system() -> Result<Arc<SystemAccess>, &'static HalError> {
    SYSTEM
        .get_or_init(|| SystemAccess::new(HalConfig::from_env()).map(Arc::new))
        .as_ref()
        .map(Arc::clone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_query() {
        assert_eq!(default_value(SystemQuery::NumQpus), 12);
        assert_eq!(default_value(SystemQuery::TotalVpmMemoryBytes), 4096);
        assert_eq!(default_value(SystemQuery::TotalGpuMemoryBytes), 0);
    }

    #[test]
    fn missing_backends_fall_back_to_defaults() {
        let system = SystemAccess::from_backends(HalConfig::for_privileges(true), Backends::default());
        assert_eq!(system.memory_backend().name(), "none");
        assert_eq!(system.execution_backend().name(), "none");
        assert_eq!(system.num_qpus(), DEFAULT_QPU_COUNT);
        assert_eq!(system.total_vpm_memory(), DEFAULT_VPM_MEMORY);
        assert_eq!(system.total_gpu_memory(), 0);
        assert!(matches!(
            system.allocate_buffer(64, 4096),
            Err(HalError::Unsupported(_))
        ));
    }
}
