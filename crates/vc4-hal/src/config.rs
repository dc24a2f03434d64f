//! Environment-driven backend selection.
//!
//! The configuration is read once, when a [`SystemAccess`](crate::SystemAccess) is built, and is
//! immutable afterwards.

use std::time::Duration;

use crate::memory::CacheType;

pub const EMULATOR_ENV: &str = "VC4_EMULATOR";
pub const EXECUTE_REGISTER_POKING_ENV: &str = "VC4_EXECUTE_REGISTER_POKING";
pub const EXECUTE_MAILBOX_ENV: &str = "VC4_EXECUTE_MAILBOX";
pub const EXECUTE_VCHI_ENV: &str = "VC4_EXECUTE_VCHI";
pub const MEMORY_CMA_ENV: &str = "VC4_MEMORY_CMA";
pub const MEMORY_VCSM_ENV: &str = "VC4_MEMORY_VCSM";
pub const MEMORY_MAILBOX_ENV: &str = "VC4_MEMORY_MAILBOX";
pub const CACHE_FORCE_ENV: &str = "VC4_CACHE_FORCE";
pub const NO_MAILBOX_ENV: &str = "VC4_NO_MAILBOX";
pub const NO_V3D_ENV: &str = "VC4_NO_V3D";
pub const NO_VCSM_ENV: &str = "VC4_NO_VCSM";
pub const NO_VCHI_ENV: &str = "VC4_NO_VCHI";
pub const PERFORMANCE_COUNTERS_ENV: &str = "VC4_PERFORMANCE_COUNTERS";
pub const V3D_POLL_INTERVAL_ENV: &str = "VC4_V3D_POLL_INTERVAL_US";

/// Backend used to dispatch kernels to the QPUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Write the dispatch registers of the mapped V3D block directly (requires root).
    V3dRegisterPoking,
    /// Ask the firmware through the mailbox `EXECUTE_QPU` property.
    Mailbox,
    /// Submit jobs to the firmware GPU service over VCHI.
    Vchi,
}

/// Backend used to allocate GPU-visible memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryMode {
    /// Firmware allocations via the mailbox, mapped through `/dev/mem` (requires root).
    Mailbox,
    /// VideoCore shared memory through the legacy `/dev/vcsm` driver.
    Vcsm,
    /// VideoCore shared memory backed by the contiguous memory allocator (`/dev/vcsm-cma`).
    VcsmCma,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalConfig {
    /// Route everything to the in-process [`Emulator`](crate::Emulator).
    pub emulated: bool,
    pub execution: ExecutionMode,
    pub memory: MemoryMode,
    /// Cache policy applied to every allocation, overriding the requested one.
    pub forced_cache: Option<CacheType>,
    pub disable_mailbox: bool,
    pub disable_v3d: bool,
    pub disable_vcsm: bool,
    pub disable_vchi: bool,
    /// Map the V3D registers for performance counters even when not executing through them.
    pub performance_counters: bool,
    /// Sleep between two polls of the V3D completion counter. Zero spins.
    pub v3d_poll_interval: Duration,
}

impl HalConfig {
    /// Defaults for a process with the given privileges.
    ///
    /// Root can map `/dev/mem`, so it gets the mailbox allocator and register poking. Everybody
    /// else goes through the VCSM (CMA) allocator and the VCHI GPU service.
    pub fn for_privileges(is_root: bool) -> Self {
        let (execution, memory) = if is_root {
            (ExecutionMode::V3dRegisterPoking, MemoryMode::Mailbox)
        } else {
            (ExecutionMode::Vchi, MemoryMode::VcsmCma)
        };
        Self {
            emulated: false,
            execution,
            memory,
            forced_cache: None,
            disable_mailbox: false,
            disable_v3d: false,
            disable_vcsm: false,
            disable_vchi: false,
            performance_counters: false,
            v3d_poll_interval: Duration::ZERO,
        }
    }

    /// Configuration for a fully emulated system.
    pub fn emulated() -> Self {
        Self {
            emulated: true,
            ..Self::for_privileges(false)
        }
    }

    /// Whether the mailbox is opened at start-up. It powers the QPUs for as long as it is open,
    /// so it is only opened when it allocates memory or executes kernels.
    pub fn activates_mailbox(&self) -> bool {
        !self.emulated
            && !self.disable_mailbox
            && (self.memory == MemoryMode::Mailbox || self.execution == ExecutionMode::Mailbox)
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        // SAFETY: `geteuid` has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        Self::from_lookup(is_root, |name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup(is_root: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|raw| flag_enabled(&raw));
        let mut config = Self::for_privileges(is_root);

        config.emulated = flag(EMULATOR_ENV);

        if flag(EXECUTE_REGISTER_POKING_ENV) {
            config.execution = ExecutionMode::V3dRegisterPoking;
        } else if flag(EXECUTE_MAILBOX_ENV) {
            config.execution = ExecutionMode::Mailbox;
        } else if flag(EXECUTE_VCHI_ENV) {
            config.execution = ExecutionMode::Vchi;
        }

        if flag(MEMORY_CMA_ENV) {
            config.memory = MemoryMode::VcsmCma;
        } else if flag(MEMORY_VCSM_ENV) {
            config.memory = MemoryMode::Vcsm;
        } else if flag(MEMORY_MAILBOX_ENV) {
            config.memory = MemoryMode::Mailbox;
        }

        config.forced_cache = lookup(CACHE_FORCE_ENV).and_then(|raw| {
            let cache = raw.trim().parse::<u8>().ok().and_then(CacheType::from_index);
            if cache.is_none() {
                tracing::warn!(value = %raw, "ignoring invalid {CACHE_FORCE_ENV}");
            }
            cache
        });

        config.disable_mailbox = flag(NO_MAILBOX_ENV);
        config.disable_v3d = flag(NO_V3D_ENV);
        config.disable_vcsm = flag(NO_VCSM_ENV);
        config.disable_vchi = flag(NO_VCHI_ENV);
        config.performance_counters = flag(PERFORMANCE_COUNTERS_ENV);

        if let Some(raw) = lookup(V3D_POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(us) => config.v3d_poll_interval = Duration::from_micros(us),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {V3D_POLL_INTERVAL_ENV}"),
            }
        }

        config
    }
}

impl Default for HalConfig {
    fn default() -> Self {
        Self::for_privileges(false)
    }
}

/// A variable that is set enables its flag, unless it is explicitly falsy.
fn flag_enabled(raw: &str) -> bool {
    let v = raw.trim();
    !(v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off"))
}
