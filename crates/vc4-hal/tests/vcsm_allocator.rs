use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Write;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use vc4_hal::vcsm::{VcsmCacheType, VcsmDriver};
use vc4_hal::DeviceMemory;
use vc4_hal::{
    Backends, BufferRequest, CacheType, ExecutionMode, HalConfig, HalError, MemoryMode,
    SystemAccess, SystemQuery, Vcsm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    OutOfMemory,
    MisalignedBusAddress,
    LockFails,
}

#[derive(Default)]
struct DriverLog {
    allocations: Vec<(u32, VcsmCacheType, String)>,
    freed: Vec<u32>,
    unlocked: usize,
    flushed: Vec<u32>,
}

/// Shared memory service backed by heap blocks. Bus addresses are `0xC000_0000 | handle << 20`.
struct HeapDriver {
    fault: Fault,
    blocks: Mutex<HashMap<u32, Box<[u8]>>>,
    next_handle: Mutex<u32>,
    log: Arc<Mutex<DriverLog>>,
}

impl HeapDriver {
    fn new(fault: Fault) -> (Self, Arc<Mutex<DriverLog>>) {
        let log = Arc::new(Mutex::new(DriverLog::default()));
        let driver = Self {
            fault,
            blocks: Mutex::default(),
            next_handle: Mutex::new(0),
            log: log.clone(),
        };
        (driver, log)
    }
}

impl VcsmDriver for HeapDriver {
    fn malloc_cache(&self, size: u32, cache: VcsmCacheType, name: &CStr) -> u32 {
        if self.fault == Fault::OutOfMemory {
            return 0;
        }
        let mut next = self.next_handle.lock().unwrap();
        *next += 1;
        let handle = *next;
        self.blocks
            .lock()
            .unwrap()
            .insert(handle, vec![0; size as usize].into_boxed_slice());
        self.log.lock().unwrap().allocations.push((
            handle,
            cache,
            name.to_string_lossy().into_owned(),
        ));
        handle
    }

    fn vc_address(&self, handle: u32) -> u32 {
        let address = 0xC000_0000 | (handle << 20);
        if self.fault == Fault::MisalignedBusAddress {
            address + 0x80
        } else {
            address
        }
    }

    fn lock(&self, handle: u32) -> Option<NonNull<u8>> {
        if self.fault == Fault::LockFails {
            return None;
        }
        let mut blocks = self.blocks.lock().unwrap();
        NonNull::new(blocks.get_mut(&handle)?.as_mut_ptr())
    }

    fn unlock_discard(&self, _host: NonNull<u8>) -> bool {
        self.log.lock().unwrap().unlocked += 1;
        true
    }

    fn free(&self, handle: u32) {
        self.blocks.lock().unwrap().remove(&handle);
        self.log.lock().unwrap().freed.push(handle);
    }

    fn flush(&self, ranges: &[(NonNull<u8>, u32)]) -> bool {
        let mut log = self.log.lock().unwrap();
        log.flushed.extend(ranges.iter().map(|(_, len)| *len));
        true
    }
}

fn vcsm_system(vcsm: Vcsm, forced_cache: Option<CacheType>) -> SystemAccess {
    SystemAccess::from_backends(
        HalConfig {
            memory: MemoryMode::VcsmCma,
            execution: ExecutionMode::Vchi,
            forced_cache,
            ..HalConfig::for_privileges(false)
        },
        Backends {
            vcsm: Some(Arc::new(vcsm)),
            ..Backends::default()
        },
    )
}

#[test]
fn allocation_maps_lock_and_frees_on_drop() {
    let (driver, log) = HeapDriver::new(Fault::None);
    let system = vcsm_system(Vcsm::with_driver(Box::new(driver), true), None);
    assert_eq!(system.memory_backend().name(), "vcsm-cma");

    let request = BufferRequest::new(1024)
        .with_cache(CacheType::HostCached)
        .with_name("uniforms");
    let mut buffer = system.allocate(&request).unwrap().unwrap();
    assert_eq!(buffer.size(), 1024);
    assert_eq!(buffer.device_ptr().value(), 0xC010_0000);
    assert_eq!(buffer.device_ptr().to_physical(), 0x0010_0000);

    buffer.write_words(0, &[1, 2, 3]);
    assert_eq!(buffer.read_word(8), 3);
    assert!(system.flush_cpu_cache(&[&buffer]));

    let handle = buffer.handle();
    drop(buffer);

    let log = log.lock().unwrap();
    assert_eq!(
        log.allocations,
        vec![(handle, VcsmCacheType::Host, "uniforms".to_string())]
    );
    assert_eq!(log.flushed, vec![1024]);
    assert_eq!(log.unlocked, 1);
    assert_eq!(log.freed, vec![handle]);
}

#[test]
fn forced_cache_overrides_the_request() {
    let (driver, log) = HeapDriver::new(Fault::None);
    let system = vcsm_system(
        Vcsm::with_driver(Box::new(driver), true),
        Some(CacheType::Uncached),
    );
    let buffer = system
        .allocate(&BufferRequest::new(64).with_cache(CacheType::BothCached))
        .unwrap();
    assert!(buffer.is_some());
    assert_eq!(log.lock().unwrap().allocations[0].1, VcsmCacheType::None);
}

#[test]
fn failed_steps_unwind_the_allocation() {
    for (fault, unlocked) in [(Fault::MisalignedBusAddress, 1), (Fault::LockFails, 0)] {
        let (driver, log) = HeapDriver::new(fault);
        let system = vcsm_system(Vcsm::with_driver(Box::new(driver), true), None);
        assert!(system.allocate_buffer(4096, 4096).unwrap().is_none(), "{fault:?}");
        let log = log.lock().unwrap();
        assert_eq!(log.freed, vec![1], "{fault:?}");
        assert_eq!(log.unlocked, unlocked, "{fault:?}");
    }

    let (driver, log) = HeapDriver::new(Fault::OutOfMemory);
    let system = vcsm_system(Vcsm::with_driver(Box::new(driver), true), None);
    assert!(system.allocate_buffer(4096, 4096).unwrap().is_none());
    assert!(log.lock().unwrap().freed.is_empty());
}

#[test]
fn invalid_request_is_rejected_before_the_driver_is_called() {
    let (driver, log) = HeapDriver::new(Fault::None);
    let vcsm = Arc::new(Vcsm::with_driver(Box::new(driver), true));
    for request in [
        BufferRequest::new(64).with_alignment(0),
        BufferRequest::new(64).with_alignment(48),
        BufferRequest::new(0),
    ] {
        assert!(matches!(
            vcsm.clone().allocate_buffer(&request),
            Err(HalError::InvalidArgument(_))
        ));
    }
    let log = log.lock().unwrap();
    assert!(log.allocations.is_empty());
    assert!(log.freed.is_empty());
}

#[test]
fn cma_pool_size_comes_from_meminfo() {
    let mut meminfo = tempfile::NamedTempFile::new().unwrap();
    writeln!(meminfo, "MemTotal:         948304 kB").unwrap();
    writeln!(meminfo, "CmaTotal:         262144 kB").unwrap();
    writeln!(meminfo, "CmaFree:          250000 kB").unwrap();

    let (driver, _) = HeapDriver::new(Fault::None);
    let vcsm = Vcsm::with_driver(Box::new(driver), true).with_meminfo_path(meminfo.path());
    assert_eq!(vcsm.total_gpu_memory().unwrap(), 256 << 20);

    let system = vcsm_system(vcsm, None);
    assert_eq!(system.total_gpu_memory(), 256 << 20);
    assert_eq!(system.query(SystemQuery::NumQpus), None);
}

#[test]
fn legacy_driver_cannot_report_the_pool_size() {
    let (driver, _) = HeapDriver::new(Fault::None);
    let vcsm = Vcsm::with_driver(Box::new(driver), false);
    assert!(matches!(
        vcsm.total_gpu_memory(),
        Err(HalError::Unsupported(_))
    ));
    let system = vcsm_system(vcsm, None);
    assert_eq!(system.memory_backend().name(), "vcsm");
    assert_eq!(system.total_gpu_memory(), 0);
}

#[test]
fn missing_meminfo_is_not_fatal_for_queries() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _) = HeapDriver::new(Fault::None);
    let vcsm = Vcsm::with_driver(Box::new(driver), true)
        .with_meminfo_path(dir.path().join("meminfo"));
    assert!(matches!(
        vcsm.total_gpu_memory(),
        Err(HalError::DeviceOpen { .. })
    ));
    assert_eq!(vcsm_system(vcsm, None).total_gpu_memory(), 0);
}
