//! Headless controller for the dimuse engine.
//!
//! Owns a shared engine and its sound store, runs the heartbeat and audio
//! threads for real-time playback, and renders offline to WAV. The CLI and
//! the integration tests drive the engine through this crate.

mod loader;
mod playback;

use dm_audio::AudioOutput;
use dm_engine::{Engine, MemoryProvider, SharedEngine};
use std::sync::atomic::Ordering;
use thiserror::Error;
use tracing::{debug, info};

use playback::PlaybackHandle;

// Re-export common types so callers don't need dm-ir/dm-engine directly.
pub use dm_audio::{AudioError, CaptureOutput};
pub use dm_engine::{Command, CommandOutput, EngineConfig, EngineError, OutputConfig};
pub use dm_formats::FormatError;
pub use dm_ir::{BufferCategory, Group, ParamId, SoundId};
pub use loader::{prepare_sound, SoundKind};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// How the provider hands a sound to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Whole file in memory, mixed in place.
    Resource,
    /// Read through a ring buffer.
    Streamed,
}

/// Headless controller: owns the engine and manages playback.
pub struct Controller {
    config: EngineConfig,
    engine: SharedEngine<MemoryProvider>,
    playback: Option<PlaybackHandle>,
}

impl Controller {
    pub fn new(config: EngineConfig) -> Result<Self, ControllerError> {
        let engine = Engine::new(config.clone(), MemoryProvider::new())?;
        Ok(Self {
            config,
            engine: SharedEngine::new(engine),
            playback: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle to the shared engine.
    pub fn engine(&self) -> SharedEngine<MemoryProvider> {
        self.engine.clone()
    }

    // --- Sound management ---

    /// Register a sound file under `sound`. WAV is converted; iMUS and VOC
    /// are stored as they are.
    pub fn load_sound(
        &mut self,
        sound: SoundId,
        data: Vec<u8>,
        residency: Residency,
    ) -> Result<SoundKind, ControllerError> {
        let (file, kind) = prepare_sound(data)?;
        debug!(sound, ?kind, ?residency, bytes = file.len(), "sound loaded");
        let mut engine = self.engine.lock();
        let provider = engine.provider_mut();
        match residency {
            Residency::Resource => provider.insert_resource(sound, file),
            Residency::Streamed => provider.insert_streamed(sound, file),
        }
        Ok(kind)
    }

    pub fn execute(&self, command: Command) -> Result<CommandOutput, ControllerError> {
        Ok(self.engine.execute(command)?)
    }

    pub fn active_sounds(&self) -> usize {
        self.engine.lock().active_count()
    }

    // --- Real-time playback ---

    /// Play through the default audio device. With `until_idle` the output
    /// thread finishes once no sound is left playing.
    pub fn play(&mut self, until_idle: bool) {
        self.stop();
        self.playback = Some(PlaybackHandle::spawn_device(
            self.engine.clone(),
            &self.config,
            until_idle,
        ));
    }

    /// Play into a caller-supplied sink.
    pub fn play_on<O>(&mut self, output: O, until_idle: bool)
    where
        O: AudioOutput + Send + 'static,
    {
        self.stop();
        self.playback = Some(PlaybackHandle::spawn(
            self.engine.clone(),
            &self.config,
            output,
            until_idle,
        ));
    }

    pub fn stop(&mut self) {
        if let Some(mut pb) = self.playback.take() {
            pb.join();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.signals.finished.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| p.signals.finished.load(Ordering::Relaxed))
    }

    /// Engine frames handed to the output so far.
    pub fn frames_played(&self) -> u64 {
        self.playback
            .as_ref()
            .map_or(0, |p| p.signals.frames_played.load(Ordering::Relaxed))
    }

    // --- Offline rendering ---

    /// Render until every sound has ended or `max_seconds` have passed,
    /// ticking the heartbeat at its configured rate in output frames.
    pub fn render_pcm(&mut self, max_seconds: u32) -> Vec<u8> {
        self.stop();
        let output = self.config.output;
        let frame_bytes = output.frame_bytes();
        let max_frames = output.sample_rate as usize * max_seconds as usize;
        let beat = (output.sample_rate / self.config.heartbeat_hz.max(1)).max(1) as usize;

        let mut engine = self.engine.lock();
        let feed = engine.feed_frames() as usize;
        let mut pcm = vec![0u8; max_frames * frame_bytes];
        let mut done = 0;
        let mut until_beat = beat;
        while done < max_frames && engine.active_count() > 0 {
            let n = feed.min(until_beat).min(max_frames - done);
            engine.render(&mut pcm[done * frame_bytes..(done + n) * frame_bytes]);
            done += n;
            until_beat -= n;
            if until_beat == 0 {
                engine.tick();
                until_beat = beat;
            }
        }
        pcm.truncate(done * frame_bytes);
        info!(frames = done, "offline render finished");
        pcm
    }

    pub fn render_to_wav(&mut self, max_seconds: u32) -> Vec<u8> {
        let pcm = self.render_pcm(max_seconds);
        let output = self.config.output;
        dm_formats::pcm_to_wav(
            &pcm,
            output.channels as u16,
            output.sample_rate,
            output.word_size as u16,
        )
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}
