//! Decoding of the board revision code (mailbox `BoardRevision` tag).

use std::fmt;

/// Set in new-style revision codes (Raspberry Pi 2 and later).
const NEW_STYLE_FLAG: u32 = 1 << 23;
const NEW_STYLE_WARRANTY: u32 = 1 << 25;
const OLD_STYLE_WARRANTY: u32 = 1 << 24;

const NEW_STYLE_MODELS: [&str; 18] = [
    "A", "B", "A+", "B+", "B+", "Alpha", "CM", "unknown", "3 B", "Zero", "3 CM", "unknown",
    "Zero W", "3 B+", "3 A+", "unknown", "3 CM+", "4 B",
];
const PROCESSORS: [&str; 4] = ["BCM2835", "BCM2836", "BCM2837", "BCM2838"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInfo {
    pub revision: u32,
    pub model: &'static str,
    /// Unknown for old-style codes, which only exist on BCM2835 boards.
    pub processor: &'static str,
    pub warranty_void: bool,
}

impl BoardInfo {
    pub fn decode(revision: u32) -> Self {
        if revision & NEW_STYLE_FLAG != 0 {
            let model = ((revision & 0xFF0) >> 4) as usize;
            let processor = ((revision & 0xF000) >> 12) as usize;
            Self {
                revision,
                model: NEW_STYLE_MODELS.get(model).copied().unwrap_or("unknown"),
                processor: PROCESSORS.get(processor).copied().unwrap_or("unknown"),
                warranty_void: revision & NEW_STYLE_WARRANTY != 0,
            }
        } else {
            let model = match revision & 0xFF {
                0x2..=0x6 | 0xD..=0xF => "B",
                0x7..=0x9 => "A",
                0x10 | 0x13 => "B+",
                0x11 | 0x14 => "CM",
                0x12 | 0x15 => "A+",
                _ => "unknown",
            };
            Self {
                revision,
                model,
                processor: "BCM2835",
                warranty_void: revision & OLD_STYLE_WARRANTY != 0,
            }
        }
    }

    /// Whether the SoC carries a VideoCore IV (everything before the BCM2711).
    pub fn has_videocore_iv(&self) -> bool {
        matches!(self.processor, "BCM2835" | "BCM2836" | "BCM2837")
    }
}

impl fmt::Display for BoardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Raspberry Pi {} ({}, revision {:#x})",
            self.model, self.processor, self.revision
        )
    }
}
