//! Sequencer core for the dimuse engine.
//!
//! Streams sound data through ring buffers, walks each sound's cue map,
//! fades parameters on a heartbeat, fires marker triggers and mixes every
//! active track into the output block.

extern crate alloc;

mod command;
mod config;
mod crossfade;
mod dispatch;
mod engine;
mod error;
mod fades;
mod host;
mod interpreter;
mod mixer;
mod music;
mod pool;
mod ring_stream;
mod save_state;
mod shared;
mod tracks;
mod triggers;
mod zones;

pub use command::{Command, CommandOutput, TriggerAction, TriggerFilter};
pub use config::{
    DuckingConfig, EngineConfig, FadeBufferConfig, OutputConfig, StreamConfig, FADE_PUSH_INTERVAL,
    MAX_FEED_FRAMES,
};
pub use crossfade::crossfade_gains;
pub use dispatch::{Dispatch, DispatchRecord, DispatchState, SoundSource, StreamingMode};
pub use engine::Engine;
pub use error::{EngineError, HostError};
pub use fades::{Fade, FadeEngine, MAX_FADES};
pub use host::{MemoryProvider, SoundProvider};
pub use interpreter::{check_hook, HOOK_WILDCARD};
pub use mixer::{channel_steps, preferred_feed_size, Mixer};
pub use music::{MusicAction, MusicCue, MusicRecord, MusicScript, MusicTable, MAX_ATTRIBUTES, MUSIC_PRIORITY};
pub use ring_stream::{StreamInfo, StreamKey, StreamSource};
pub use save_state::{SaveState, StreamRecord, TrackRecord, SAVE_MAGIC, SAVE_VERSION};
pub use shared::SharedEngine;
pub use tracks::{Track, MAX_SYNC, MAX_TRACKS, PITCH_UNITY};
pub use triggers::{Defer, Trigger, TriggerEngine, MAX_DEFERS, MAX_TRIGGERS};
pub use zones::StreamZone;
