use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vc4_hal::v3d::regs::*;
use vc4_hal::v3d::{CounterType, RegisterFile, SystemInfo};
use vc4_hal::{
    Backends, DevicePointer, ExecutionMode, HalConfig, HalError, QpuDispatch, SystemAccess,
    SystemQuery, V3d,
};

fn v3d() -> (Arc<V3d>, Arc<RegisterFile>) {
    let file = Arc::new(RegisterFile::new());
    (Arc::new(V3d::new(file.clone())), file)
}

fn register_system(v3d: Arc<V3d>, poll_interval: Duration) -> SystemAccess {
    SystemAccess::from_backends(
        HalConfig {
            execution: ExecutionMode::V3dRegisterPoking,
            v3d_poll_interval: poll_interval,
            ..HalConfig::for_privileges(true)
        },
        Backends {
            v3d: Some(v3d),
            ..Backends::default()
        },
    )
}

#[test]
fn counters_are_mapped_enabled_read_and_cleared() {
    let (v3d, file) = v3d();
    v3d.set_counter(3, CounterType::ExecutionCycles).unwrap();
    assert_eq!(file.get(V3D_PCTRE), PCTRE_ENABLE | (1 << 3));
    assert_eq!(file.get(counter_mapping(3)), CounterType::ExecutionCycles as u32);
    assert_eq!(v3d.get_counter(3).unwrap(), 0);

    file.set(counter_value(3), 77);
    assert_eq!(v3d.get_counter(3).unwrap(), 77);
    v3d.reset_counter_value(3).unwrap();
    assert_eq!(v3d.get_counter(3).unwrap(), 0);

    v3d.set_counter(15, CounterType::TmuCacheMisses).unwrap();
    v3d.disable_counter(3).unwrap();
    assert_eq!(file.get(V3D_PCTRE), PCTRE_ENABLE | (1 << 15));
}

#[test]
fn counter_index_is_checked_before_touching_registers() {
    let (v3d, file) = v3d();
    let err = v3d.set_counter(16, CounterType::IdleCycles).unwrap_err();
    assert!(matches!(
        err,
        HalError::CounterIndexOutOfRange { index: 16, max: 15 }
    ));
    assert!(!err.is_fatal());
    assert_eq!(file.get(V3D_PCTRE), 0);
    assert!(v3d.get_counter(29).is_err());
    assert!(v3d.disable_counter(16).is_err());
}

#[test]
fn power_gated_block_is_reported() {
    let (v3d, file) = v3d();
    v3d.set_counter(0, CounterType::IdleCycles).unwrap();
    file.set_power_gated(true);
    assert!(matches!(
        v3d.get_counter(0),
        Err(HalError::CounterPowerGated { index: 0 })
    ));

    let system = register_system(v3d, Duration::ZERO);
    assert_eq!(system.query(SystemQuery::NumQpus), None);
    assert_eq!(system.num_qpus(), 12);
    assert_eq!(system.total_vpm_memory(), 4096);
}

#[test]
fn zero_timeout_fails_fast_when_programs_never_complete() {
    let (v3d, _file) = v3d();
    let start = Instant::now();
    assert!(!v3d.execute(&[[0x100, 0x200]], false, Duration::ZERO));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn bounded_poll_gives_up_after_the_timeout() {
    let (v3d, _file) = v3d();
    v3d.set_poll_interval(Duration::from_millis(1));
    let timeout = Duration::from_millis(30);
    let start = Instant::now();
    assert!(!v3d.execute(&[[0x100, 0x200]], false, timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn coarse_poll_interval_does_not_overshoot_the_timeout() {
    let (v3d, _file) = v3d();
    v3d.set_poll_interval(Duration::from_millis(500));
    let timeout = Duration::from_millis(10);
    let start = Instant::now();
    assert!(!v3d.execute(&[[0x100, 0x200]], false, timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < Duration::from_millis(250), "polled for {elapsed:?}");
}

#[test]
fn dispatch_writes_cache_clears_and_program_queue() {
    let (v3d, file) = v3d();
    file.set_auto_complete(true);
    // Stale counts from an earlier dispatch must not count towards this one.
    file.set(V3D_SRQCS, (7 << SRQCS_COMPLETED_SHIFT) | (7 << SRQCS_REQUESTS_SHIFT));

    let control = [[0x1000, 0x2000], [0x1100, 0x2000], [0x1200, 0x2000]];
    assert!(v3d.execute(&control, true, Duration::from_millis(100)));

    assert_eq!(file.get(V3D_L2CACTL), L2CACTL_L2CCLR);
    assert_eq!(file.get(V3D_SLCACTL), SLCACTL_CLEAR_ALL);
    assert_eq!(file.get(V3D_SRQUA), 0x1200);
    assert_eq!(file.get(V3D_SRQPC), 0x2000);
    assert_eq!(v3d.system_info(SystemInfo::UserProgramsRequested), 3);
    assert_eq!(v3d.system_info(SystemInfo::UserProgramsCompleted), 3);
}

#[test]
fn dispatch_without_flush_leaves_caches_alone() {
    let (v3d, file) = v3d();
    file.set_auto_complete(true);
    assert!(v3d.execute(&[[0x1000, 0x2000]], false, Duration::from_millis(100)));
    assert_eq!(file.get(V3D_L2CACTL), 0);
    assert_eq!(file.get(V3D_SLCACTL), 0);
}

#[test]
fn facade_waits_for_programs_completed_elsewhere() {
    let (v3d, file) = v3d();
    let system = register_system(v3d.clone(), Duration::from_millis(1));
    assert!(system.executes_kernels_via_v3d());
    assert_eq!(v3d.poll_interval(), Duration::from_millis(1));
    assert_eq!(system.num_qpus(), 12);
    assert_eq!(system.total_vpm_memory(), 12 * 1024);

    let completer = {
        let file = file.clone();
        thread::spawn(move || {
            // Complete only once both programs were queued, after the dispatch reset the counts.
            for _ in 0..5000 {
                if (file.get(V3D_SRQCS) >> SRQCS_REQUESTS_SHIFT) & SRQCS_COUNT_MASK == 2 {
                    thread::sleep(Duration::from_millis(10));
                    file.complete_programs(2);
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let control = [[0x1000, 0x2000], [0x1100, 0x2000]];
    let dispatch = QpuDispatch {
        control: &control,
        control_address: DevicePointer::new(0xC000_0000),
        flush_cache: false,
        timeout: Duration::from_secs(5),
    };
    let mut handle = system.execute_qpu(&dispatch).unwrap();
    assert!(handle.wait());
    completer.join().unwrap();
}
