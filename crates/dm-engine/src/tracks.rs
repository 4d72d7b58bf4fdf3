//! TrackScheduler: fixed pool of voice tracks with priority eviction.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use dm_ir::{Group, ParamId, SoundId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::pool::{Chain, Pool};

/// Maximum number of simultaneous tracks.
pub const MAX_TRACKS: usize = 8;

/// Lip-sync buffers per track.
pub const MAX_SYNC: usize = 4;

/// Unity pitch in 8.8 fixed point.
pub const PITCH_UNITY: i32 = 256;

/// Voice parameters of one playing sound.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub sound: SoundId,
    pub group: Group,
    pub priority: i32,
    pub vol: i32,
    /// `vol` scaled by group and ducking; what the mixer uses.
    pub eff_vol: i32,
    pub pan: i32,
    /// 1/256 semitone.
    pub detune: i32,
    /// Semitones.
    pub transpose: i32,
    /// 8.8 fixed point playback rate factor.
    pub pitch_shift: i32,
    pub mailbox: i32,
    pub jump_hook: i32,
    pub sync: [Vec<u8>; MAX_SYNC],
}

impl Track {
    pub fn new(sound: SoundId, priority: i32, group: Group) -> Self {
        Self {
            sound,
            group,
            priority: priority.clamp(0, 127),
            vol: 127,
            eff_vol: 127,
            pan: 64,
            pitch_shift: PITCH_UNITY,
            ..Default::default()
        }
    }

    /// Recompute `pitch_shift` from transpose and detune.
    pub fn update_pitch(&mut self) {
        let cents = (self.transpose * 256 + self.detune) as f64 / 3072.0;
        self.pitch_shift = (PITCH_UNITY as f64 * libm::exp2(cents)) as i32;
    }

    /// Store a lip-sync block in the first free slot.
    pub fn add_sync(&mut self, data: &[u8]) -> bool {
        match self.sync.iter_mut().find(|s| s.is_empty()) {
            Some(slot) => {
                slot.extend_from_slice(data);
                true
            }
            None => {
                warn!(sound = self.sound, "all sync buffers in use, dropping sync block");
                false
            }
        }
    }

    /// Stored (non-derived) parameter value.
    pub fn param(&self, param: ParamId) -> Option<i32> {
        Some(match param {
            ParamId::Group => self.group.value(),
            ParamId::Priority => self.priority,
            ParamId::Volume => self.vol,
            ParamId::Pan => self.pan,
            ParamId::Detune => self.detune,
            ParamId::Transpose => self.transpose,
            ParamId::Mailbox => self.mailbox,
            _ => return None,
        })
    }

    /// Validate and store a writable parameter. Volume changes leave
    /// `eff_vol` to the caller, which knows the group volumes.
    pub fn set_param(&mut self, param: ParamId, value: i32) -> Result<(), EngineError> {
        if !param.is_writable() {
            return Err(EngineError::InvalidParam(param));
        }
        if let Some((lo, hi)) = param.range() {
            if !(lo..=hi).contains(&value) {
                return Err(EngineError::InvalidValue { param, value });
            }
        }
        match param {
            ParamId::Group => {
                self.group = Group::from_value(value)
                    .ok_or(EngineError::InvalidValue { param, value })?;
            }
            ParamId::Priority => self.priority = value,
            ParamId::Volume => self.vol = value,
            ParamId::Pan => self.pan = value,
            ParamId::Detune => {
                self.detune = value;
                self.update_pitch();
            }
            ParamId::Transpose => {
                self.transpose = value;
                self.update_pitch();
            }
            ParamId::Mailbox => self.mailbox = value,
            _ => return Err(EngineError::InvalidParam(param)),
        }
        Ok(())
    }
}

/// How a new sound gets its track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    Free,
    /// The pool is full; this lower-or-equal priority sound must be
    /// stopped first.
    Evict(SoundId),
}

/// Pool of tracks plus the active list, in start order.
pub struct TrackScheduler {
    pool: Pool<Track>,
    active: Chain,
}

impl Default for TrackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackScheduler {
    pub fn new() -> Self {
        Self { pool: Pool::with_capacity(MAX_TRACKS), active: Chain::new() }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Slot index of the track playing `sound`.
    pub fn find(&self, sound: SoundId) -> Option<usize> {
        self.pool.iter(&self.active).find(|(_, t)| t.sound == sound).map(|(i, _)| i)
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.pool.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.pool.get_mut(index)
    }

    pub fn by_sound(&self, sound: SoundId) -> Option<&Track> {
        self.find(sound).and_then(|i| self.pool.get(i))
    }

    pub fn by_sound_mut(&mut self, sound: SoundId) -> Option<&mut Track> {
        let index = self.find(sound)?;
        self.pool.get_mut(index)
    }

    /// Active tracks in start order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Track)> + '_ {
        self.pool.iter(&self.active)
    }

    /// Snapshot of active slot indices, for loops that stop tracks.
    pub fn indices(&self) -> ArrayVec<usize, MAX_TRACKS> {
        self.pool.iter(&self.active).map(|(i, _)| i).collect()
    }

    /// Decide where a sound of `priority` would go.
    ///
    /// With the pool full, the lowest-priority active track (first found
    /// on ties) is evicted if `priority` is at least its priority.
    pub fn plan_allocation(&self, sound: SoundId, priority: i32) -> Result<Allocation, EngineError> {
        if self.find(sound).is_some() {
            return Err(EngineError::AlreadyPlaying(sound));
        }
        if self.pool.free_count() > 0 {
            return Ok(Allocation::Free);
        }
        let victim = self
            .pool
            .iter(&self.active)
            .fold(None::<&Track>, |lowest, (_, t)| match lowest {
                Some(l) if l.priority <= t.priority => Some(l),
                _ => Some(t),
            });
        match victim {
            Some(v) if priority >= v.priority => {
                debug!(sound, victim = v.sound, "evicting lower priority track");
                Ok(Allocation::Evict(v.sound))
            }
            _ => {
                warn!(sound, priority, "no track available");
                Err(EngineError::NoTrack(sound))
            }
        }
    }

    /// Link a new track into the active list. Returns its slot index.
    pub fn insert(&mut self, track: Track) -> Result<usize, EngineError> {
        let sound = track.sound;
        self.pool
            .push_back(&mut self.active, track)
            .map_err(|_| EngineError::NoTrack(sound))
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.pool.remove(&mut self.active, index)
    }

    /// Smallest active sound id strictly greater than `sound`.
    pub fn next_sound(&self, sound: SoundId) -> Option<SoundId> {
        self.pool
            .iter(&self.active)
            .map(|(_, t)| t.sound)
            .filter(|&s| s > sound)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_pool(priorities: [i32; MAX_TRACKS]) -> TrackScheduler {
        let mut tracks = TrackScheduler::new();
        for (i, p) in priorities.into_iter().enumerate() {
            tracks.insert(Track::new(i as SoundId + 1, p, Group::Sfx)).unwrap();
        }
        tracks
    }

    #[test]
    fn free_slots_come_first() {
        let tracks = TrackScheduler::new();
        assert_eq!(tracks.plan_allocation(1, 0), Ok(Allocation::Free));
    }

    #[test]
    fn duplicate_sound_is_refused() {
        let mut tracks = TrackScheduler::new();
        tracks.insert(Track::new(5, 10, Group::Music)).unwrap();
        assert_eq!(tracks.plan_allocation(5, 127), Err(EngineError::AlreadyPlaying(5)));
    }

    #[test]
    fn evicts_lowest_priority_first_found() {
        let tracks = full_pool([50, 20, 90, 20, 60, 70, 80, 100]);
        assert_eq!(tracks.plan_allocation(99, 20), Ok(Allocation::Evict(2)));
        assert_eq!(tracks.plan_allocation(99, 127), Ok(Allocation::Evict(2)));
    }

    #[test]
    fn lower_priority_newcomer_is_rejected() {
        let tracks = full_pool([50, 20, 90, 20, 60, 70, 80, 100]);
        assert_eq!(tracks.plan_allocation(99, 19), Err(EngineError::NoTrack(99)));
        assert_eq!(tracks.len(), MAX_TRACKS);
    }

    #[test]
    fn next_sound_enumerates_in_id_order() {
        let mut tracks = TrackScheduler::new();
        for id in [30, 10, 20] {
            tracks.insert(Track::new(id, 0, Group::Sfx)).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = 0;
        while let Some(next) = tracks.next_sound(cursor) {
            seen.push(next);
            cursor = next;
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn removal_unlinks() {
        let mut tracks = TrackScheduler::new();
        let a = tracks.insert(Track::new(1, 0, Group::Sfx)).unwrap();
        tracks.insert(Track::new(2, 0, Group::Sfx)).unwrap();
        assert_eq!(tracks.remove(a).map(|t| t.sound), Some(1));
        assert_eq!(tracks.find(1), None);
        assert_eq!(tracks.iter().map(|(_, t)| t.sound).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn params_are_validated() {
        let mut t = Track::new(1, 0, Group::Sfx);
        assert!(t.set_param(ParamId::Volume, 100).is_ok());
        assert_eq!(t.param(ParamId::Volume), Some(100));
        assert_eq!(
            t.set_param(ParamId::Volume, 128),
            Err(EngineError::InvalidValue { param: ParamId::Volume, value: 128 })
        );
        assert_eq!(t.set_param(ParamId::PositionMs, 0), Err(EngineError::InvalidParam(ParamId::PositionMs)));
        assert!(t.set_param(ParamId::Group, 2).is_ok());
        assert_eq!(t.group, Group::Music);
        assert!(t.set_param(ParamId::Mailbox, -5).is_ok());
        assert_eq!(t.param(ParamId::HasStream), None);
    }

    #[test]
    fn pitch_follows_transpose_and_detune() {
        let mut t = Track::new(1, 0, Group::Sfx);
        assert_eq!(t.pitch_shift, PITCH_UNITY);
        t.set_param(ParamId::Transpose, 12).unwrap();
        assert_eq!(t.pitch_shift, 512);
        t.set_param(ParamId::Transpose, -12).unwrap();
        assert_eq!(t.pitch_shift, 128);
        t.set_param(ParamId::Transpose, 0).unwrap();
        t.set_param(ParamId::Detune, 3072).unwrap();
        assert_eq!(t.pitch_shift, 512);
    }

    #[test]
    fn sync_buffers_fill_in_order() {
        let mut t = Track::new(1, 0, Group::Speech);
        for i in 0..MAX_SYNC {
            assert!(t.add_sync(&[i as u8; 4]));
        }
        assert!(!t.add_sync(&[9; 4]));
        assert_eq!(t.sync[2], vec![2; 4]);
    }
}
