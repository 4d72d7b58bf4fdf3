//! Engine and host error types.

use dm_formats::FormatError;
use dm_ir::{ParamId, SoundId};
use thiserror::Error;

/// Failure reported by a [`SoundProvider`](crate::SoundProvider).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("sound {0} is not available")]
    NotFound(SoundId),
    #[error("sound {0} is not open")]
    NotOpen(SoundId),
    #[error("seek to {offset} is outside sound {sound}")]
    BadSeek { sound: SoundId, offset: u64 },
    #[error("i/o error: {0}")]
    Io(String),
}

/// Error type for engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // --- configuration ---
    #[error("parameter {0:?} cannot be used here")]
    InvalidParam(ParamId),
    #[error("value {value} is out of range for {param:?}")]
    InvalidValue { param: ParamId, value: i32 },
    #[error("marker text of {0} bytes is too long")]
    MarkerTooLong(usize),
    #[error("fade length {0} is negative")]
    InvalidFadeLength(i32),
    #[error("defer delay {0} must be positive")]
    InvalidDelay(i32),
    #[error("sound id {0} is not valid")]
    InvalidSound(SoundId),
    #[error("sync buffer {0} does not exist")]
    InvalidSyncId(usize),
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    // --- exhaustion ---
    #[error("no track available for sound {0}")]
    NoTrack(SoundId),
    #[error("fade pool exhausted")]
    NoFadeSlot,
    #[error("trigger pool exhausted")]
    NoTriggerSlot,
    #[error("defer pool exhausted")]
    NoDeferSlot,
    #[error("no stream buffer available for sound {0}")]
    NoStream(SoundId),

    // --- data ---
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("save data is invalid: {0}")]
    SaveData(String),

    // --- ordering ---
    #[error("navigation error: {0}")]
    Navigation(&'static str),
    #[error("sound {0} is already playing")]
    AlreadyPlaying(SoundId),
    #[error("sound {0} is not playing")]
    NotPlaying(SoundId),
    #[error("music script is not initialized")]
    NotInitialized,
    #[error("music script is already initialized")]
    AlreadyInitialized,
}
