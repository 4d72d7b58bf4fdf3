//! Audio output trait, error types and the engine PCM decoder.

use dm_engine::OutputConfig;
use thiserror::Error;

/// Error type for audio operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// Failed to initialize audio device
    #[error("device init error: {0}")]
    DeviceInit(String),
    /// Failed to create audio stream
    #[error("stream create error: {0}")]
    StreamCreate(String),
    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),
    /// No audio device available
    #[error("no audio device available")]
    NoDevice,
    /// Engine output layout the backend cannot carry
    #[error("unsupported engine output: {0}")]
    Layout(&'static str),
}

/// One interleaved stereo frame, the unit every backend queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StereoFrame {
    pub left: i16,
    pub right: i16,
}

impl StereoFrame {
    pub const fn silence() -> Self {
        Self { left: 0, right: 0 }
    }
}

/// Decode engine output bytes into stereo frames. 8-bit output is
/// unsigned, 16-bit is signed little-endian; mono is duplicated to both
/// sides. A trailing partial frame is ignored.
pub fn decode_pcm<'a>(
    bytes: &'a [u8],
    output: &OutputConfig,
) -> Result<impl Iterator<Item = StereoFrame> + 'a, AudioError> {
    let wide = match output.word_size {
        8 => false,
        16 => true,
        _ => return Err(AudioError::Layout("word size must be 8 or 16")),
    };
    let stereo = match output.channels {
        1 => false,
        2 => true,
        _ => return Err(AudioError::Layout("channel count must be 1 or 2")),
    };
    let sample_bytes = if wide { 2 } else { 1 };
    let frame_bytes = sample_bytes * if stereo { 2 } else { 1 };
    let sample = move |b: &[u8]| -> i16 {
        if wide {
            i16::from_le_bytes([b[0], b[1]])
        } else {
            ((b[0] as i16) - 128) << 8
        }
    };
    Ok(bytes.chunks_exact(frame_bytes).map(move |frame| {
        let left = sample(frame);
        let right = if stereo { sample(&frame[sample_bytes..]) } else { left };
        StereoFrame { left, right }
    }))
}

/// Trait for audio output backends.
pub trait AudioOutput {
    /// Device sample rate.
    fn sample_rate(&self) -> u32;

    /// Frames that can be written without dropping any.
    fn free_frames(&self) -> usize;

    /// Frames queued but not yet played.
    fn queued_frames(&self) -> usize {
        0
    }

    /// Queue frames. Returns how many were accepted.
    fn write(&mut self, frames: &[StereoFrame]) -> usize;

    /// Start playback.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop playback.
    fn stop(&mut self) -> Result<(), AudioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(word_size: u8, channels: u8) -> OutputConfig {
        OutputConfig { word_size, channels, ..Default::default() }
    }

    #[test]
    fn mono_bytes_fill_both_sides() {
        let frames: Vec<_> = decode_pcm(&[0x80, 0xff, 0x00], &output(8, 1)).unwrap().collect();
        assert_eq!(frames[0], StereoFrame::silence());
        assert_eq!(frames[1], StereoFrame { left: 127 << 8, right: 127 << 8 });
        assert_eq!(frames[2].left, -32768);
    }

    #[test]
    fn stereo_words_keep_their_sides() {
        let bytes = [0x34, 0x12, 0xff, 0xff, 0x01];
        let frames: Vec<_> = decode_pcm(&bytes, &output(16, 2)).unwrap().collect();
        assert_eq!(frames, vec![StereoFrame { left: 0x1234, right: -1 }]);
    }

    #[test]
    fn rejects_unknown_layout() {
        assert!(decode_pcm(&[], &output(12, 2)).is_err());
        assert!(decode_pcm(&[], &output(16, 6)).is_err());
    }
}
