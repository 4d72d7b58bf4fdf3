//! Typed command surface.
//!
//! One variant per operation the scripting layer can invoke. Triggers and
//! defers store commands too, which is why the type is serializable.

use alloc::boxed::Box;
use alloc::vec::Vec;

use dm_ir::{BufferCategory, Group, MarkerText, ParamId, SoundId};
use serde::{Deserialize, Serialize};

use crate::ring_stream::StreamInfo;

/// What a trigger or defer does when it fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerAction {
    /// Tell the music script the current sequence ended.
    StopSequence,
    Command(Box<Command>),
}

impl TriggerAction {
    pub fn command(cmd: Command) -> Self {
        TriggerAction::Command(Box::new(cmd))
    }
}

/// Match criteria for `check_trigger` / `clear_trigger`; `None` matches any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub sound: Option<SoundId>,
    pub marker: Option<MarkerText>,
    pub action: Option<TriggerAction>,
}

impl TriggerFilter {
    pub fn sound(sound: SoundId) -> Self {
        Self { sound: Some(sound), ..Default::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Init,
    Pause,
    Resume,
    /// Set a group volume, or read it with `volume: None`.
    SetGroupVol { group: Group, volume: Option<i32> },
    StartSound { sound: SoundId, priority: i32, group: Group },
    StopSound { sound: SoundId },
    StopAllSounds,
    GetNextSound { sound: SoundId },
    SetParam { sound: SoundId, param: ParamId, value: i32 },
    GetParam { sound: SoundId, param: ParamId },
    FadeParam { sound: SoundId, param: ParamId, target: i32, ticks: i32 },
    SetHook { sound: SoundId, hook: i32 },
    GetHook { sound: SoundId },
    SetTrigger { sound: SoundId, marker: MarkerText, action: TriggerAction },
    CheckTrigger(TriggerFilter),
    ClearTrigger(TriggerFilter),
    DeferCommand { ticks: i32, action: TriggerAction },
    StartStream { sound: SoundId, priority: i32, category: BufferCategory },
    SwitchStream { old: SoundId, new: SoundId, fade_ms: u32, sync: bool },
    ProcessStreams,
    QueryStream { sound: SoundId },
    FeedStream { sound: SoundId, data: Vec<u8>, paused: bool },
    LipSync { sound: SoundId, sync_id: usize, ms: i32 },
}

/// Result of [`Engine::execute`](crate::Engine::execute).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutput {
    Done,
    Value(i32),
    Sound(Option<SoundId>),
    Stream(StreamInfo),
    LipSync { width: i32, height: i32 },
}

impl CommandOutput {
    /// Integer view of the result, as the scripting layer sees it.
    pub fn as_value(&self) -> i32 {
        match *self {
            CommandOutput::Done => 0,
            CommandOutput::Value(v) => v,
            CommandOutput::Sound(s) => s.map_or(0, |s| s as i32),
            CommandOutput::Stream(info) => info.buffered as i32,
            CommandOutput::LipSync { width, .. } => width,
        }
    }
}
