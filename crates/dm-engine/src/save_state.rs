//! Versioned save data.
//!
//! The snapshot holds logical state only: ring buffer contents, stream
//! zones and in-flight crossfade audio are rebuilt or dropped on restore.

use alloc::string::ToString;
use alloc::vec::Vec;

use dm_ir::{BufferCategory, SoundId};
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchRecord;
use crate::error::EngineError;
use crate::fades::{Fade, MAX_FADES};
use crate::music::MusicRecord;
use crate::tracks::Track;
use crate::triggers::{Defer, Trigger, MAX_DEFERS, MAX_TRIGGERS};

pub const SAVE_MAGIC: [u8; 4] = *b"DMSV";
pub const SAVE_VERSION: u16 = 1;

/// Stream a saved track was reading from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub category: BufferCategory,
    /// Bytes were pushed by the caller rather than fetched.
    pub fed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track: Track,
    pub dispatch: DispatchRecord,
    pub stream: Option<StreamRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    pub magic: [u8; 4],
    pub version: u16,
    /// Speech sound open at save time.
    pub open_speech: Option<SoundId>,
    pub fades: [Option<Fade>; MAX_FADES],
    pub triggers: [Option<Trigger>; MAX_TRIGGERS],
    pub defers: [Option<Defer>; MAX_DEFERS],
    pub tracks: Vec<TrackRecord>,
    pub group_volumes: [i32; 3],
    pub music_eff_vol: i32,
    pub music: MusicRecord,
}

impl SaveState {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(self).map_err(|e| EngineError::SaveData(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() < SAVE_MAGIC.len() || bytes[..SAVE_MAGIC.len()] != SAVE_MAGIC {
            return Err(EngineError::SaveData("bad magic".to_string()));
        }
        let state: SaveState =
            bincode::deserialize(bytes).map_err(|e| EngineError::SaveData(e.to_string()))?;
        if state.version != SAVE_VERSION {
            return Err(EngineError::SaveData(alloc::format!(
                "unsupported version {}",
                state.version
            )));
        }
        Ok(state)
    }
}
