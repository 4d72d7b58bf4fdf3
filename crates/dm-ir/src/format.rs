//! PCM format descriptor.

use serde::{Deserialize, Serialize};

/// Format of a block of source PCM, as declared by the last `FRMT` event.
///
/// All word sizes are unsigned offset-binary. 16-bit words are big-endian;
/// 12-bit words pack two samples into three bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Bits per sample: 8, 12 or 16.
    pub word_size: u8,
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            word_size: 16,
            sample_rate: 22050,
            channels: 2,
        }
    }
}

impl AudioFormat {
    pub const fn new(word_size: u8, sample_rate: u32, channels: u8) -> Self {
        Self {
            word_size,
            sample_rate,
            channels,
        }
    }

    /// Returns true if the mixer can consume this format.
    pub fn is_valid(&self) -> bool {
        matches!(self.word_size, 8 | 12 | 16)
            && matches!(self.channels, 1 | 2)
            && self.sample_rate > 0
    }

    /// Smallest whole unit of data as `(bytes, frames)`.
    ///
    /// Splitting a buffer anywhere but on a block boundary would swap
    /// channels or tear a packed 12-bit pair.
    pub const fn block(&self) -> (u32, u32) {
        let ch = self.channels as u32;
        match self.word_size {
            12 => {
                if ch == 1 {
                    (3, 2)
                } else {
                    (3, 1)
                }
            }
            16 => (2 * ch, 1),
            _ => (ch, 1),
        }
    }

    /// Round a byte count down to a whole number of blocks.
    pub const fn align_down(&self, bytes: u32) -> u32 {
        let (block, _) = self.block();
        bytes - bytes % block
    }

    /// Number of whole frames held in `bytes`.
    pub const fn bytes_to_frames(&self, bytes: u32) -> u32 {
        let (block_bytes, block_frames) = self.block();
        bytes / block_bytes * block_frames
    }

    /// Bytes needed for `frames`, rounded down to whole blocks.
    pub const fn frames_to_bytes(&self, frames: u32) -> u32 {
        let (block_bytes, block_frames) = self.block();
        frames / block_frames * block_bytes
    }

    /// Bytes of source data per second.
    pub const fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.word_size as u32 / 8
    }

    /// Byte size of a fade lasting `fade_ms`, aligned down to whole blocks.
    pub fn fade_bytes(&self, fade_ms: u32) -> u32 {
        let raw = (self.word_size as u64
            * self.channels as u64
            * self.sample_rate as u64
            * fade_ms as u64)
            / 8000;
        self.align_down(raw.min(u32::MAX as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes() {
        assert_eq!(AudioFormat::new(8, 22050, 1).block(), (1, 1));
        assert_eq!(AudioFormat::new(8, 22050, 2).block(), (2, 1));
        assert_eq!(AudioFormat::new(16, 22050, 2).block(), (4, 1));
        assert_eq!(AudioFormat::new(12, 22050, 1).block(), (3, 2));
        assert_eq!(AudioFormat::new(12, 22050, 2).block(), (3, 1));
    }

    #[test]
    fn frames_and_bytes_agree() {
        let fmt = AudioFormat::new(12, 22050, 1);
        assert_eq!(fmt.bytes_to_frames(9), 6);
        assert_eq!(fmt.frames_to_bytes(6), 9);
        // A lone frame of packed 12-bit mono cannot be addressed.
        assert_eq!(fmt.frames_to_bytes(1), 0);
    }

    #[test]
    fn fade_bytes_never_splits_a_stereo_frame() {
        let fmt = AudioFormat::new(16, 22050, 2);
        // 16 * 2 * 22050 * 7 / 8000 = 617.4 -> 617 -> 616
        assert_eq!(fmt.fade_bytes(7), 616);
        assert_eq!(fmt.fade_bytes(7) % 4, 0);
        assert_eq!(fmt.fade_bytes(1000), fmt.byte_rate());
    }

    #[test]
    fn byte_rate_counts_packed_words() {
        assert_eq!(AudioFormat::new(12, 22050, 2).byte_rate(), 66150);
        assert_eq!(AudioFormat::new(8, 11025, 1).byte_rate(), 11025);
    }

    #[test]
    fn validity() {
        assert!(AudioFormat::default().is_valid());
        assert!(!AudioFormat::new(24, 22050, 2).is_valid());
        assert!(!AudioFormat::new(16, 22050, 3).is_valid());
        assert!(!AudioFormat::new(16, 0, 2).is_valid());
    }
}
