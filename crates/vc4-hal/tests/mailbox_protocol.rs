use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use vc4_hal::mailbox::message::{HEADER_WORDS, RESPONSE_ERROR};
use vc4_hal::mailbox::{
    Clock, Mailbox, MailboxMessage, MailboxStatus, MailboxTag, MailboxTransport, MemoryFlags,
    RESPONSE_SUCCESS,
};
use vc4_hal::{
    Backends, BufferRequest, DeviceMemory, DevicePointer, ExecutionState, HalConfig, HalError,
    MemoryMode, QpuDispatch, SystemAccess, SystemQuery,
};

#[derive(Default)]
struct FirmwareState {
    next_handle: u32,
    allocated: BTreeSet<u32>,
    locked: BTreeSet<u32>,
    calls: Vec<Vec<u32>>,
    qpus_enabled: bool,
}

/// Answers property calls the way the VideoCore firmware does, for the tags the HAL uses.
#[derive(Clone, Default)]
struct FakeFirmware {
    state: Arc<Mutex<FirmwareState>>,
}

impl FakeFirmware {
    fn calls_with(&self, tag: MailboxTag) -> Vec<Vec<u32>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call[2] == tag.id())
            .cloned()
            .collect()
    }
}

impl MailboxTransport for FakeFirmware {
    fn property_call(&mut self, buffer: &mut [u32]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(buffer.to_vec());
        assert_eq!(buffer[0] as usize, buffer.len() * 4, "size word");
        assert_eq!(*buffer.last().unwrap(), 0, "end tag");

        let content = buffer[HEADER_WORDS..].to_vec();
        let answer: Option<Vec<u32>> = match buffer[2] {
            t if t == MailboxTag::EnableQpu.id() => {
                state.qpus_enabled = content[0] != 0;
                Some(vec![0])
            }
            t if t == MailboxTag::AllocateMemory.id() => {
                state.next_handle += 1;
                let handle = state.next_handle;
                state.allocated.insert(handle);
                Some(vec![handle])
            }
            t if t == MailboxTag::LockMemory.id() => {
                let handle = content[0];
                if state.allocated.contains(&handle) {
                    state.locked.insert(handle);
                    Some(vec![0xC000_0000 | ((handle - 1) << 23)])
                } else {
                    Some(vec![0])
                }
            }
            t if t == MailboxTag::UnlockMemory.id() => {
                let handle = content[0];
                Some(vec![u32::from(!state.locked.remove(&handle))])
            }
            t if t == MailboxTag::ReleaseMemory.id() => {
                let handle = content[0];
                Some(vec![u32::from(!state.allocated.remove(&handle))])
            }
            t if t == MailboxTag::GetClockRate.id() => {
                let clock = content[0];
                let rate = if clock == Clock::V3d as u32 { 300_000_000 } else { 1_200_000_000 };
                Some(vec![clock, rate])
            }
            t if t == MailboxTag::VcMemory.id() => Some(vec![0x3b00_0000, 0x0500_0000]),
            t if t == MailboxTag::BoardRevision.id() => Some(vec![0x00a0_2082]),
            t if t == MailboxTag::GetTemperature.id() => Some(vec![0, 48_312]),
            t if t == MailboxTag::ExecuteQpu.id() => Some(vec![0]),
            _ => None,
        };
        drop(state);

        match answer {
            Some(words) => {
                buffer[1] = RESPONSE_SUCCESS;
                buffer[4] = (1 << 31) | (words.len() as u32 * 4);
                buffer[HEADER_WORDS..HEADER_WORDS + words.len()].copy_from_slice(&words);
            }
            None => buffer[1] = RESPONSE_ERROR,
        }
        Ok(())
    }
}

fn open() -> (Mailbox, FakeFirmware) {
    let firmware = FakeFirmware::default();
    let mailbox = Mailbox::new(Box::new(firmware.clone())).unwrap();
    (mailbox, firmware)
}

#[test]
fn request_layout_matches_the_property_interface() {
    let message = MailboxMessage::new(MailboxTag::AllocateMemory, &[4096, 4096, 0x4], 1);
    assert_eq!(
        message.as_words(),
        &[36, 0, 0x3000C, 12, 12, 4096, 4096, 0x4, 0]
    );
    assert_eq!(message.total_size_bytes(), (3 + 6) * 4);
    assert_eq!(message.status(), MailboxStatus::Malformed(0));
}

#[test]
fn allocation_lock_unlock_release_cycle() {
    let (mailbox, firmware) = open();
    assert!(firmware.state.lock().unwrap().qpus_enabled);

    let first = mailbox.allocate(8192, 4096, MemoryFlags::DIRECT).unwrap();
    let second = mailbox.allocate(4096, 4096, MemoryFlags::DIRECT).unwrap();
    assert_eq!((first, second), (1, 2));

    let ptr = mailbox.lock(second).unwrap();
    assert_eq!(ptr, DevicePointer::new(0xC000_0000 | (1 << 23)));
    assert_eq!(ptr.to_physical(), 1 << 23);

    assert!(mailbox.unlock(second).unwrap());
    assert!(!mailbox.unlock(second).unwrap(), "double unlock");
    assert!(mailbox.release(second).unwrap());
    assert!(mailbox.release(first).unwrap());
    assert!(!mailbox.release(first).unwrap(), "double release");

    let request = &firmware.calls_with(MailboxTag::AllocateMemory)[0];
    assert_eq!(&request[HEADER_WORDS..HEADER_WORDS + 3], &[8192, 4096, 0x4]);
}

#[test]
fn invalid_buffer_request_never_reaches_the_firmware() {
    let (mailbox, firmware) = open();
    let mailbox = Arc::new(mailbox);
    let result = mailbox.allocate_buffer(&BufferRequest::new(64).with_alignment(0));
    assert!(matches!(result, Err(HalError::InvalidArgument(_))));
    assert!(firmware.calls_with(MailboxTag::AllocateMemory).is_empty());
}

#[test]
fn locking_an_unknown_handle_gives_null() {
    let (mailbox, _) = open();
    assert!(mailbox.lock(42).unwrap().is_null());
}

#[test]
fn unknown_tags_report_failure_not_errors() {
    let (mailbox, _) = open();
    assert_eq!(mailbox.firmware_revision().unwrap(), None);
    assert_eq!(mailbox.throttled().unwrap(), None);

    let mut message = MailboxMessage::new(MailboxTag::GetTurbo, &[0], 2);
    assert_eq!(
        mailbox.call(&mut message).unwrap(),
        MailboxStatus::Failure(RESPONSE_ERROR)
    );
}

#[test]
fn queries_read_the_response_words() {
    let (mailbox, _) = open();
    assert_eq!(mailbox.clock_rate(Clock::V3d).unwrap(), Some(300_000_000));
    assert_eq!(mailbox.clock_rate(Clock::Arm).unwrap(), Some(1_200_000_000));
    assert_eq!(mailbox.vc_memory().unwrap(), Some((0x3b00_0000, 0x0500_0000)));
    assert_eq!(mailbox.temperature().unwrap(), Some(48_312));
}

#[test]
fn execution_sends_count_control_noflush_and_timeout() {
    let (mailbox, firmware) = open();
    let mailbox = Arc::new(mailbox);
    let system = SystemAccess::from_backends(
        HalConfig {
            memory: MemoryMode::Mailbox,
            execution: vc4_hal::ExecutionMode::Mailbox,
            ..HalConfig::for_privileges(true)
        },
        Backends {
            mailbox: Some(mailbox),
            ..Backends::default()
        },
    );

    let control = [[0x100, 0x200], [0x300, 0x200]];
    let dispatch = QpuDispatch {
        control: &control,
        control_address: DevicePointer::new(0xC080_0000),
        flush_cache: true,
        timeout: Duration::from_millis(1500),
    };
    let mut handle = system.execute_qpu(&dispatch).unwrap();
    assert_eq!(handle.state(), ExecutionState::Passed);
    assert!(handle.wait());

    let request = &firmware.calls_with(MailboxTag::ExecuteQpu)[0];
    assert_eq!(
        &request[HEADER_WORDS..HEADER_WORDS + 4],
        &[2, 0xC080_0000, 0, 1500]
    );
}

#[test]
fn facade_answers_from_the_mailbox() {
    let (mailbox, _) = open();
    let system = SystemAccess::from_backends(
        HalConfig::for_privileges(true),
        Backends {
            mailbox: Some(Arc::new(mailbox)),
            ..Backends::default()
        },
    );
    assert_eq!(system.qpu_clock_rate(), 300_000_000);
    assert_eq!(system.total_gpu_memory(), 0x0500_0000);
    assert_eq!(system.gpu_temperature(), 48_312);
    assert_eq!(system.query(SystemQuery::NumQpus), None);
    assert_eq!(system.num_qpus(), 12);
    let board = system.board_info().unwrap();
    assert_eq!(board.model, "3 B");
}

#[test]
fn dropping_the_mailbox_disables_the_qpus() {
    let (mailbox, firmware) = open();
    drop(mailbox);
    let state = firmware.state.lock().unwrap();
    assert!(!state.qpus_enabled);
}
