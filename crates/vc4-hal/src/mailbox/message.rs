//! Property-channel message layout.
//!
//! ```text
//! word 0   total buffer size in bytes
//! word 1   0 on request, response code on return
//! word 2   tag id
//! word 3   content size in bytes (max of request and response)
//! word 4   request size in bytes; on return bit 31 set, bits 0..30 = response size
//! word 5.. content words, zero padded
//! last     0 (end tag)
//! ```

use bitflags::bitflags;

/// Number of words before the content.
pub const HEADER_WORDS: usize = 5;

/// Response code of a request the firmware processed successfully.
pub const RESPONSE_SUCCESS: u32 = 0x8000_0000;
/// Response code of a request the firmware failed to parse.
pub const RESPONSE_ERROR: u32 = 0x8000_0001;

const RESPONSE_BIT: u32 = 1 << 31;

/// Property tags understood by the firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MailboxTag {
    FirmwareRevision = 0x0000_0001,
    BoardModel = 0x0001_0001,
    BoardRevision = 0x0001_0002,
    MacAddress = 0x0001_0003,
    BoardSerial = 0x0001_0004,
    ArmMemory = 0x0001_0005,
    VcMemory = 0x0001_0006,
    Clocks = 0x0001_0007,
    GetPowerState = 0x0002_0001,
    Timing = 0x0002_0002,
    SetPowerState = 0x0002_8001,
    GetClockState = 0x0003_0001,
    SetClockState = 0x0003_8001,
    GetClockRate = 0x0003_0002,
    GetClockRateMeasured = 0x0003_0047,
    SetClockRate = 0x0003_8002,
    GetMaxClockRate = 0x0003_0004,
    GetMinClockRate = 0x0003_0007,
    GetTurbo = 0x0003_0009,
    SetTurbo = 0x0003_8009,
    GetVoltage = 0x0003_0003,
    SetVoltage = 0x0003_8003,
    GetMaxVoltage = 0x0003_0005,
    GetMinVoltage = 0x0003_0008,
    GetTemperature = 0x0003_0006,
    GetMaxTemperature = 0x0003_000A,
    GetStc = 0x0003_000B,
    AllocateMemory = 0x0003_000C,
    LockMemory = 0x0003_000D,
    UnlockMemory = 0x0003_000E,
    ReleaseMemory = 0x0003_000F,
    ExecuteCode = 0x0003_0010,
    ExecuteQpu = 0x0003_0011,
    EnableQpu = 0x0003_0012,
    GetThrottled = 0x0003_0046,
    CommandLine = 0x0005_0001,
    DmaChannels = 0x0006_0001,
}

impl MailboxTag {
    pub const fn id(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// Flags of the `AllocateMemory` tag.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Can be resized to 0 at any time. Use for cached data.
        const DISCARDABLE = 1 << 0;
        /// Alias 0x0: L1 and L2 cached.
        const NORMAL = 0;
        /// Alias 0xC: uncached.
        const DIRECT = 1 << 2;
        /// Alias 0x8: L2 only.
        const COHERENT = 2 << 2;
        /// Allocating in L2.
        const L1_NONALLOCATING = Self::DIRECT.bits() | Self::COHERENT.bits();
        /// Initialise buffer to all zeros.
        const ZERO = 1 << 4;
        /// Don't initialise (default is initialise to all ones).
        const NO_INIT = 1 << 5;
        /// Likely to be locked for long periods of time.
        const HINT_PERMALOCK = 1 << 6;
        /// Allocate from the first 256 MB.
        const LOW_256M = 1 << 1;
    }
}

/// Clock ids for the clock tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Clock {
    Emmc = 1,
    Uart = 2,
    Arm = 3,
    Core = 4,
    V3d = 5,
    H264 = 6,
    Isp = 7,
    Sdram = 8,
    Pixel = 9,
    Pwm = 10,
}

/// Classification of the response code (word 1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MailboxStatus {
    Success,
    /// The response bit is set, but the firmware reported an error.
    Failure(u32),
    /// The response bit is not set: the buffer was never processed.
    Malformed(u32),
}

impl MailboxStatus {
    pub fn classify(code: u32) -> Self {
        if code == RESPONSE_SUCCESS {
            MailboxStatus::Success
        } else if code & RESPONSE_BIT != 0 {
            MailboxStatus::Failure(code)
        } else {
            MailboxStatus::Malformed(code)
        }
    }

    pub fn is_success(self) -> bool {
        self == MailboxStatus::Success
    }
}

/// A single-tag property message. The response overwrites the request in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    words: Vec<u32>,
}

impl MailboxMessage {
    /// Builds a request for `tag` that has room for `response_words` words of response.
    pub fn new(tag: MailboxTag, request: &[u32], response_words: usize) -> Self {
        let content_words = request.len().max(response_words);
        let total_words = HEADER_WORDS + content_words + 1;
        let mut words = vec![0u32; total_words];
        words[0] = (total_words * 4) as u32;
        words[1] = 0;
        words[2] = tag.id();
        words[3] = (content_words * 4) as u32;
        words[4] = (request.len() * 4) as u32;
        words[HEADER_WORDS..HEADER_WORDS + request.len()].copy_from_slice(request);
        // Last word stays 0: end tag.
        Self { words }
    }

    pub fn total_size_bytes(&self) -> u32 {
        self.words[0]
    }

    pub fn tag(&self) -> u32 {
        self.words[2]
    }

    pub fn content_words(&self) -> usize {
        self.words.len() - HEADER_WORDS - 1
    }

    pub fn status(&self) -> MailboxStatus {
        MailboxStatus::classify(self.words[1])
    }

    /// Whether the firmware marked the tag itself as answered.
    pub fn has_tag_response(&self) -> bool {
        self.words[4] & RESPONSE_BIT != 0
    }

    /// Size of the tag response in bytes, as reported by the firmware.
    pub fn response_size_bytes(&self) -> u32 {
        self.words[4] & !RESPONSE_BIT
    }

    /// Content word `index`, or 0 past the end of the content.
    pub fn content(&self, index: usize) -> u32 {
        if index < self.content_words() {
            self.words[HEADER_WORDS + index]
        } else {
            0
        }
    }

    pub fn end_tag(&self) -> u32 {
        self.words[self.words.len() - 1]
    }

    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    pub fn as_words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }
}

#[cfg(feature = "syscall-trace")]
pub(crate) fn hex_dump(words: &[u32]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(words.len() * 11);
    for (i, word) in words.iter().enumerate() {
        if i != 0 {
            out.push(' ');
        }
        let _ = write!(out, "{word:08x}");
    }
    out
}
