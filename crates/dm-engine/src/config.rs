//! Engine configuration.

use dm_ir::BufferCategory;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Largest feed the mixer accumulates in one call, in output frames.
pub const MAX_FEED_FRAMES: u32 = 4096;

/// Ticks between pushes of a fading value to its track.
pub const FADE_PUSH_INTERVAL: i32 = 6;

/// Top-level engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output: OutputConfig,
    /// Heartbeat rate driving fades, triggers and defers.
    pub heartbeat_hz: u32,
    /// Rate of the speech ducking step; must divide `heartbeat_hz` sensibly.
    pub ducking_hz: u32,
    pub ducking: DuckingConfig,
    pub streams: StreamConfig,
    pub fade_buffers: FadeBufferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            heartbeat_hz: 50,
            ducking_hz: 10,
            ducking: DuckingConfig::default(),
            streams: StreamConfig::default(),
            fade_buffers: FadeBufferConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let out = &self.output;
        if !(1..=2).contains(&out.channels) {
            return Err(EngineError::Config("output channels must be 1 or 2"));
        }
        if out.word_size != 8 && out.word_size != 16 {
            return Err(EngineError::Config("output word size must be 8 or 16"));
        }
        if out.sample_rate == 0 {
            return Err(EngineError::Config("output sample rate must be positive"));
        }
        if self.heartbeat_hz == 0 {
            return Err(EngineError::Config("heartbeat rate must be positive"));
        }
        self.streams.validate()
    }

    /// Heartbeats between two ducking steps.
    pub fn ducking_divider(&self) -> u32 {
        (self.heartbeat_hz / self.ducking_hz.max(1)).max(1)
    }
}

/// Format of the PCM handed to the audio sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sample_rate: u32,
    /// 1 or 2.
    pub channels: u8,
    /// 8 (unsigned) or 16 (signed little-endian).
    pub word_size: u8,
    /// Frames mixed per feed call.
    pub feed_frames: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            channels: 2,
            word_size: 16,
            feed_frames: 512,
        }
    }
}

impl OutputConfig {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.word_size as usize / 8)
    }
}

/// Music attenuation while speech plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckingConfig {
    /// Ducked music volume is `music_vol * target_num / 128`.
    pub target_num: i32,
    /// Step toward the ducked volume.
    pub attack_step: i32,
    /// Step back toward full music volume.
    pub release_step: i32,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            target_num: 80,
            attack_step: 18,
            release_step: 3,
        }
    }
}

/// Ring buffer sizing for streamed sounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub music_buffer: u32,
    pub speech_buffer: u32,
    pub sfx_buffer: u32,
    /// Bytes fetched per fetch call.
    pub load_size: u32,
    /// Below this many buffered bytes a stream is serviced first.
    pub critical_size: u32,
    /// Largest span `request_contiguous` must serve across the seam.
    pub max_read: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            music_buffer: 0x4_0000,
            speech_buffer: 0x2_0000,
            sfx_buffer: 0x2_0000,
            load_size: 0x4000,
            critical_size: 0x8000,
            max_read: 0x9000,
        }
    }
}

impl StreamConfig {
    /// Every category buffer must hold two atomic reads, so a ring always
    /// has room past its seam copy.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_read == 0 {
            return Err(EngineError::Config("stream max_read must be positive"));
        }
        if self.load_size == 0 {
            return Err(EngineError::Config("stream load_size must be positive"));
        }
        let smallest = BufferCategory::ALL.map(|c| self.buffer_size(c)).into_iter().min().unwrap_or(0);
        if smallest < 2 * self.max_read {
            return Err(EngineError::Config("stream buffers must hold two max_read spans"));
        }
        Ok(())
    }

    pub fn buffer_size(&self, category: BufferCategory) -> u32 {
        match category {
            BufferCategory::Music => self.music_buffer,
            BufferCategory::Speech => self.speech_buffer,
            BufferCategory::Sfx => self.sfx_buffer,
        }
    }
}

/// Crossfade buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeBufferConfig {
    pub large_count: usize,
    pub large_size: u32,
    pub small_count: usize,
    pub small_size: u32,
}

impl Default for FadeBufferConfig {
    fn default() -> Self {
        Self {
            large_count: 2,
            large_size: 0x2_0000,
            small_count: 6,
            small_size: 0x8000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_output_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.output.sample_rate, 22050);
        assert_eq!(cfg.output.frame_bytes(), 4);
        assert_eq!(cfg.ducking_divider(), 5);
    }

    fn stream_error(streams: StreamConfig) -> Option<EngineError> {
        EngineConfig { streams, ..Default::default() }.validate().err()
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_unusable_output() {
        let mut cfg = EngineConfig::default();
        cfg.output.word_size = 12;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
        cfg.output.word_size = 8;
        cfg.output.sample_rate = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
        let cfg = EngineConfig { heartbeat_hz: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_degenerate_streams() {
        let base = StreamConfig::default();
        let zero = StreamConfig { music_buffer: 0, max_read: 0, ..base };
        assert!(matches!(stream_error(zero), Some(EngineError::Config(_))));
        let empty = StreamConfig { speech_buffer: 0, ..base };
        assert!(matches!(stream_error(empty), Some(EngineError::Config(_))));
        let wide = StreamConfig { max_read: base.sfx_buffer, ..base };
        assert!(matches!(stream_error(wide), Some(EngineError::Config(_))));
        let idle = StreamConfig { load_size: 0, ..base };
        assert!(matches!(stream_error(idle), Some(EngineError::Config(_))));

        let tight = StreamConfig { sfx_buffer: 2 * base.max_read, ..base };
        assert_eq!(stream_error(tight), None);
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let cfg: EngineConfig = toml::from_str(
            "heartbeat_hz = 60\n[output]\nchannels = 1\n[ducking]\ntarget_num = 77\n",
        )
        .unwrap();
        assert_eq!(cfg.heartbeat_hz, 60);
        assert_eq!(cfg.output.channels, 1);
        assert_eq!(cfg.output.sample_rate, 22050);
        assert_eq!(cfg.ducking.target_num, 77);
        assert_eq!(cfg.ducking.attack_step, 18);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn toml_with_bad_values_is_rejected() {
        let cfg: EngineConfig = toml::from_str("[streams]\nmusic_buffer = 0\n").unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
        let cfg: EngineConfig = toml::from_str("[output]\nword_size = 24\n").unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
        assert!(toml::from_str::<EngineConfig>("[output]\nchannels = -1\n").is_err());
    }

    #[test]
    fn ducking_divider_never_zero() {
        let cfg = EngineConfig { heartbeat_hz: 5, ducking_hz: 10, ..Default::default() };
        assert_eq!(cfg.ducking_divider(), 1);
    }
}
