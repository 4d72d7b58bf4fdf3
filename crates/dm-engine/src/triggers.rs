//! Marker triggers and deferred commands.

use dm_ir::{MarkerText, SoundId};
use heapless::Vec as HVec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::{TriggerAction, TriggerFilter};
use crate::error::EngineError;

pub const MAX_TRIGGERS: usize = 8;
pub const MAX_DEFERS: usize = 8;

/// A one-shot callback waiting for a marker of a sound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub sound: SoundId,
    /// Empty matches any marker.
    pub marker: MarkerText,
    pub action: TriggerAction,
    /// Cleared while a scan was running; removed when it ends.
    pub clear_later: bool,
}

impl Trigger {
    fn matches(&self, filter: &TriggerFilter) -> bool {
        filter.sound.map_or(true, |s| s == self.sound)
            && filter.marker.as_ref().map_or(true, |m| *m == self.marker)
            && filter.action.as_ref().map_or(true, |a| *a == self.action)
    }

    fn fires_on(&self, sound: SoundId, marker: &str) -> bool {
        !self.clear_later
            && self.sound == sound
            && (self.marker.is_empty() || self.marker.as_str() == marker)
    }
}

/// A command scheduled a number of heartbeats ahead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defer {
    pub counter: i32,
    pub action: TriggerAction,
}

pub struct TriggerEngine {
    triggers: [Option<Trigger>; MAX_TRIGGERS],
    defers: [Option<Defer>; MAX_DEFERS],
    processing: u32,
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            triggers: core::array::from_fn(|_| None),
            defers: core::array::from_fn(|_| None),
            processing: 0,
        }
    }

    pub fn set(
        &mut self,
        sound: SoundId,
        marker: MarkerText,
        action: TriggerAction,
    ) -> Result<(), EngineError> {
        if sound == 0 {
            return Err(EngineError::InvalidSound(sound));
        }
        let Some(slot) = self.triggers.iter_mut().find(|t| t.is_none()) else {
            warn!(sound, marker = marker.as_str(), "trigger pool exhausted");
            return Err(EngineError::NoTriggerSlot);
        };
        *slot = Some(Trigger { sound, marker, action, clear_later: false });
        Ok(())
    }

    /// Number of pending triggers matching `filter`.
    pub fn check(&self, filter: &TriggerFilter) -> usize {
        self.triggers
            .iter()
            .flatten()
            .filter(|t| !t.clear_later && t.matches(filter))
            .count()
    }

    /// Remove matching triggers. During a scan they are only flagged.
    pub fn clear(&mut self, filter: &TriggerFilter) {
        for slot in &mut self.triggers {
            if let Some(trigger) = slot {
                if trigger.matches(filter) {
                    if self.processing > 0 {
                        trigger.clear_later = true;
                    } else {
                        *slot = None;
                    }
                }
            }
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing > 0
    }

    /// Enter a marker scan; pair with [`end_processing`](Self::end_processing).
    pub fn begin_processing(&mut self) {
        self.processing += 1;
    }

    /// Next trigger at or after `cursor` firing on `marker`. The trigger is
    /// consumed and its action returned.
    pub fn next_match(
        &mut self,
        cursor: &mut usize,
        sound: SoundId,
        marker: &str,
    ) -> Option<TriggerAction> {
        while *cursor < MAX_TRIGGERS {
            let index = *cursor;
            *cursor += 1;
            if self.triggers[index].as_ref().is_some_and(|t| t.fires_on(sound, marker)) {
                return self.triggers[index].take().map(|t| t.action);
            }
        }
        None
    }

    /// Leave a marker scan, applying deferred clears once the outermost
    /// scan ends.
    pub fn end_processing(&mut self) {
        self.processing = self.processing.saturating_sub(1);
        if self.processing == 0 {
            for slot in &mut self.triggers {
                if slot.as_ref().is_some_and(|t| t.clear_later) {
                    *slot = None;
                }
            }
        }
    }

    /// Run `action` after `ticks` heartbeats.
    ///
    /// The countdown fires when it reaches 1, not 0, so the action runs
    /// `ticks - 1` heartbeats from now and a count of 1 never fires.
    pub fn defer(&mut self, ticks: i32, action: TriggerAction) -> Result<(), EngineError> {
        if ticks <= 0 {
            return Err(EngineError::InvalidDelay(ticks));
        }
        let Some(slot) = self.defers.iter_mut().find(|d| d.is_none()) else {
            warn!(ticks, "defer pool exhausted");
            return Err(EngineError::NoDeferSlot);
        };
        *slot = Some(Defer { counter: ticks, action });
        Ok(())
    }

    /// Count every defer down one heartbeat, returning the actions due.
    pub fn tick_defers(&mut self) -> HVec<TriggerAction, MAX_DEFERS> {
        let mut due = HVec::new();
        for slot in &mut self.defers {
            let Some(defer) = slot else {
                continue;
            };
            defer.counter -= 1;
            if defer.counter == 1 {
                // At most one entry per slot, so this never overflows.
                let _ = due.push(defer.action.clone());
            }
            if defer.counter <= 0 {
                *slot = None;
            }
        }
        due
    }

    pub fn clear_all(&mut self) {
        self.triggers = core::array::from_fn(|_| None);
        self.defers = core::array::from_fn(|_| None);
        self.processing = 0;
    }

    /// Drop triggers set on a stopped sound. Defers carry no sound and
    /// are left to run.
    pub fn clear_sound(&mut self, sound: SoundId) {
        self.clear(&TriggerFilter::sound(sound));
    }

    pub fn triggers(&self) -> &[Option<Trigger>; MAX_TRIGGERS] {
        &self.triggers
    }

    pub fn defers(&self) -> &[Option<Defer>; MAX_DEFERS] {
        &self.defers
    }

    pub fn restore(
        &mut self,
        triggers: [Option<Trigger>; MAX_TRIGGERS],
        defers: [Option<Defer>; MAX_DEFERS],
    ) {
        self.triggers = triggers;
        self.defers = defers;
        self.processing = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn marker(s: &str) -> MarkerText {
        MarkerText::from(s).unwrap()
    }

    fn stop(sound: SoundId) -> TriggerAction {
        TriggerAction::command(Command::StopSound { sound })
    }

    fn fire(engine: &mut TriggerEngine, sound: SoundId, text: &str) -> Vec<TriggerAction> {
        let mut fired = Vec::new();
        let mut cursor = 0;
        engine.begin_processing();
        while let Some(action) = engine.next_match(&mut cursor, sound, text) {
            fired.push(action);
        }
        engine.end_processing();
        fired
    }

    #[test]
    fn trigger_fires_once() {
        let mut t = TriggerEngine::new();
        t.set(1, marker("chorus"), stop(2)).unwrap();
        assert!(fire(&mut t, 1, "verse").is_empty());
        assert_eq!(fire(&mut t, 1, "chorus"), vec![stop(2)]);
        assert!(fire(&mut t, 1, "chorus").is_empty());
    }

    #[test]
    fn empty_marker_matches_any() {
        let mut t = TriggerEngine::new();
        t.set(1, MarkerText::new(), TriggerAction::StopSequence).unwrap();
        assert!(fire(&mut t, 2, "x").is_empty());
        assert_eq!(fire(&mut t, 1, "anything"), vec![TriggerAction::StopSequence]);
    }

    #[test]
    fn clearing_a_sound_keeps_defers() {
        let mut t = TriggerEngine::new();
        t.set(1, marker("chorus"), stop(2)).unwrap();
        t.set(3, marker("chorus"), stop(4)).unwrap();
        t.defer(5, stop(1)).unwrap();
        t.clear_sound(1);
        assert_eq!(t.check(&TriggerFilter::sound(1)), 0);
        assert_eq!(t.check(&TriggerFilter::sound(3)), 1);
        assert_eq!(t.defers().iter().flatten().count(), 1);
    }

    #[test]
    fn clear_during_scan_is_deferred() {
        let mut t = TriggerEngine::new();
        t.set(1, marker("a"), stop(5)).unwrap();
        t.set(1, marker("b"), stop(6)).unwrap();

        t.begin_processing();
        let mut cursor = 0;
        assert!(t.next_match(&mut cursor, 1, "a").is_some());
        // A callback clears everything for sound 1 mid-scan.
        t.clear(&TriggerFilter::sound(1));
        assert_eq!(t.triggers().iter().flatten().count(), 1);
        assert_eq!(t.check(&TriggerFilter::sound(1)), 0);
        assert!(t.next_match(&mut cursor, 1, "b").is_none());
        t.end_processing();

        assert_eq!(t.triggers().iter().flatten().count(), 0);
    }

    #[test]
    fn check_and_clear_with_wildcards() {
        let mut t = TriggerEngine::new();
        t.set(1, marker("a"), stop(5)).unwrap();
        t.set(2, marker("a"), TriggerAction::StopSequence).unwrap();
        t.set(2, marker("b"), stop(5)).unwrap();

        let by_marker = TriggerFilter { marker: Some(marker("a")), ..Default::default() };
        assert_eq!(t.check(&by_marker), 2);
        let by_action = TriggerFilter { action: Some(stop(5)), ..Default::default() };
        assert_eq!(t.check(&by_action), 2);
        assert_eq!(t.check(&TriggerFilter::default()), 3);

        t.clear(&TriggerFilter::sound(2));
        assert_eq!(t.check(&TriggerFilter::default()), 1);
    }

    #[test]
    fn pool_exhaustion() {
        let mut t = TriggerEngine::new();
        for _ in 0..MAX_TRIGGERS {
            t.set(1, marker("m"), TriggerAction::StopSequence).unwrap();
        }
        assert_eq!(
            t.set(1, marker("m"), TriggerAction::StopSequence),
            Err(EngineError::NoTriggerSlot)
        );
    }

    #[test]
    fn defer_fires_at_counter_one() {
        let mut t = TriggerEngine::new();
        t.defer(3, stop(9)).unwrap();
        assert!(t.tick_defers().is_empty()); // 2
        assert_eq!(t.tick_defers().as_slice(), &[stop(9)]); // 1
        assert!(t.tick_defers().is_empty()); // 0, freed
        assert!(t.defers().iter().all(Option::is_none));
    }

    #[test]
    fn defer_of_one_tick_never_fires() {
        let mut t = TriggerEngine::new();
        t.defer(1, stop(9)).unwrap();
        assert!(t.tick_defers().is_empty());
        assert!(t.defers().iter().all(Option::is_none));
    }

    #[test]
    fn defer_rejects_zero() {
        let mut t = TriggerEngine::new();
        assert!(t.defer(0, stop(1)).is_err());
        for _ in 0..MAX_DEFERS {
            t.defer(10, stop(1)).unwrap();
        }
        assert_eq!(t.defer(10, stop(1)), Err(EngineError::NoDeferSlot));
    }
}
