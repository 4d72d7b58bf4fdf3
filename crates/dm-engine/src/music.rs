//! Table-driven music script.
//!
//! Maps game music states and cutscene sequences to sounds. The script only
//! decides what should play; the engine carries the decisions out.

use alloc::vec::Vec;

use dm_ir::SoundId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Generic script attributes kept in save data.
pub const MAX_ATTRIBUTES: usize = 228;

/// Priority music tracks are started with.
pub const MUSIC_PRIORITY: i32 = 127;

/// One table row: a state or sequence id and the sound it plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicCue {
    pub id: i32,
    pub sound: SoundId,
    /// Crossfade when switching to this cue from another.
    #[serde(default)]
    pub fade_ms: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicTable {
    #[serde(default)]
    pub states: Vec<MusicCue>,
    #[serde(default)]
    pub sequences: Vec<MusicCue>,
}

impl MusicTable {
    fn state(&self, id: i32) -> Option<&MusicCue> {
        self.states.iter().find(|c| c.id == id)
    }

    fn sequence(&self, id: i32) -> Option<&MusicCue> {
        self.sequences.iter().find(|c| c.id == id)
    }
}

/// What the engine should do for a script decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MusicAction {
    Nothing,
    Start(SoundId),
    Switch { from: SoundId, to: SoundId, fade_ms: u32 },
    Stop(SoundId),
}

/// Persisted script scalars.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicRecord {
    pub state: i32,
    pub sequence: i32,
    pub next_sequence: i32,
    pub attributes: Vec<i32>,
    /// Cue id of older titles, stored but not interpreted.
    pub music_cue: i32,
}

impl Default for MusicRecord {
    fn default() -> Self {
        Self {
            state: 0,
            sequence: 0,
            next_sequence: 0,
            attributes: alloc::vec![0; MAX_ATTRIBUTES],
            music_cue: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct MusicScript {
    table: Option<MusicTable>,
    record: MusicRecord,
}

impl MusicScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cue table. Loading twice is refused.
    pub fn init(&mut self, table: MusicTable) -> Result<(), EngineError> {
        if self.table.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        self.table = Some(table);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    /// Drop the table and all scalars.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record(&self) -> &MusicRecord {
        &self.record
    }

    pub fn restore(&mut self, mut record: MusicRecord) {
        record.attributes.resize(MAX_ATTRIBUTES, 0);
        self.record = record;
    }

    pub fn state(&self) -> i32 {
        self.record.state
    }

    pub fn sequence(&self) -> i32 {
        self.record.sequence
    }

    pub fn next_sequence(&self) -> i32 {
        self.record.next_sequence
    }

    pub fn attribute(&self, index: usize) -> Option<i32> {
        self.record.attributes.get(index).copied()
    }

    pub fn set_attribute(&mut self, index: usize, value: i32) -> Result<(), EngineError> {
        let slot = self
            .record
            .attributes
            .get_mut(index)
            .ok_or(EngineError::Navigation("attribute index out of range"))?;
        *slot = value;
        Ok(())
    }

    fn table(&self) -> Result<&MusicTable, EngineError> {
        self.table.as_ref().ok_or(EngineError::NotInitialized)
    }

    fn state_sound(&self, state: i32) -> Option<SoundId> {
        self.table.as_ref()?.state(state).map(|c| c.sound)
    }

    /// Sound the current state or sequence should be playing.
    pub fn current_sound(&self) -> Option<SoundId> {
        let table = self.table.as_ref()?;
        if self.record.sequence != 0 {
            table.sequence(self.record.sequence).map(|c| c.sound)
        } else {
            table.state(self.record.state).map(|c| c.sound)
        }
    }

    /// Enter a music state. While a sequence plays the state is only
    /// remembered.
    pub fn set_state(&mut self, state: i32) -> Result<MusicAction, EngineError> {
        let table = self.table()?;
        if state == self.record.state {
            return Ok(MusicAction::Nothing);
        }
        let target = table.state(state).copied();
        let current = self.state_sound(self.record.state);
        self.record.state = state;
        if self.record.sequence != 0 {
            return Ok(MusicAction::Nothing);
        }
        debug!(state, "music state");
        Ok(transition(current, target))
    }

    /// Start a sequence, or queue it behind the one playing.
    pub fn set_sequence(&mut self, sequence: i32) -> Result<MusicAction, EngineError> {
        let table = self.table()?;
        if sequence != 0 && table.sequence(sequence).is_none() {
            return Err(EngineError::Navigation("unknown music sequence"));
        }
        if self.record.sequence != 0 && sequence != 0 {
            self.record.next_sequence = sequence;
            return Ok(MusicAction::Nothing);
        }
        let current = self.current_sound();
        self.record.sequence = sequence;
        let target = self.table()?.sequence(sequence).copied();
        let action = match target {
            Some(cue) => transition(current, Some(cue)),
            None => {
                let state = self.table()?.state(self.record.state).copied();
                transition(current, state)
            }
        };
        Ok(action)
    }

    /// A sequence signalled its end: play the queued one, or fall back to
    /// the state music.
    pub fn stop_sequence(&mut self) -> Result<MusicAction, EngineError> {
        if self.record.sequence == 0 {
            return Ok(MusicAction::Nothing);
        }
        let next = core::mem::take(&mut self.record.next_sequence);
        let current = self.current_sound();
        if next != 0 {
            self.record.sequence = next;
            let cue = self.table()?.sequence(next).copied();
            return Ok(transition(current, cue));
        }
        self.record.sequence = 0;
        let state = self.table()?.state(self.record.state).copied();
        Ok(transition(current, state))
    }
}

fn transition(current: Option<SoundId>, target: Option<MusicCue>) -> MusicAction {
    match (current, target) {
        (Some(from), Some(cue)) if from == cue.sound => MusicAction::Nothing,
        (Some(from), Some(cue)) => MusicAction::Switch { from, to: cue.sound, fade_ms: cue.fade_ms },
        (None, Some(cue)) => MusicAction::Start(cue.sound),
        (Some(from), None) => MusicAction::Stop(from),
        (None, None) => MusicAction::Nothing,
    }
}
