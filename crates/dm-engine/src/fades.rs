//! Parameter fades.
//!
//! A fade moves one track parameter linearly to a target over a number of
//! heartbeat ticks using integer slope plus a remainder accumulator, so the
//! step schedule is exact and reproducible.

use dm_ir::{ParamId, SoundId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::FADE_PUSH_INTERVAL;
use crate::error::EngineError;

/// Concurrent fades across all tracks.
pub const MAX_FADES: usize = 16;

/// One active fade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fade {
    pub sound: SoundId,
    pub param: ParamId,
    /// Interpolated value, ahead of what the track last received.
    pub current: i32,
    /// Ticks left.
    pub counter: i32,
    pub length: i32,
    pub slope: i32,
    /// `|target - start| mod length`.
    pub slope_mod: i32,
    /// Remainder accumulator.
    pub overflow: i32,
    /// +1 or -1.
    pub nudge: i32,
}

impl Fade {
    /// Advance one tick. Returns true if the value changed.
    fn step(&mut self) -> bool {
        self.counter -= 1;
        let mut next = self.current + self.slope;
        self.overflow += self.slope_mod;
        if self.overflow >= self.length {
            self.overflow -= self.length;
            next += self.nudge;
        }
        let changed = next != self.current;
        self.current = next;
        changed
    }
}

/// What `start` decided to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeStart {
    /// Zero-length fade: apply the target now.
    Immediate(i32),
    /// Zero-length volume fade to silence: stop the sound now.
    Stop,
    Started,
}

/// Value delivered to a track by [`FadeEngine::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadePush {
    Set { sound: SoundId, param: ParamId, value: i32 },
    /// A volume fade reached zero.
    Stop(SoundId),
}

/// Fixed pool of fades.
pub struct FadeEngine {
    slots: [Option<Fade>; MAX_FADES],
}

impl Default for FadeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FadeEngine {
    pub fn new() -> Self {
        Self { slots: [None; MAX_FADES] }
    }

    /// Start fading `param` of `sound` from `current` to `target`.
    ///
    /// Any fade already running on the same parameter is replaced.
    pub fn start(
        &mut self,
        sound: SoundId,
        param: ParamId,
        current: i32,
        target: i32,
        ticks: i32,
    ) -> Result<FadeStart, EngineError> {
        if sound == 0 {
            return Err(EngineError::InvalidSound(sound));
        }
        if ticks < 0 {
            return Err(EngineError::InvalidFadeLength(ticks));
        }
        if !param.is_fadeable() {
            return Err(EngineError::InvalidParam(param));
        }

        self.clear(Some(sound), Some(param));

        if ticks == 0 {
            if param == ParamId::Volume && target == 0 {
                return Ok(FadeStart::Stop);
            }
            return Ok(FadeStart::Immediate(target));
        }

        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            warn!(sound, ?param, "fade pool exhausted");
            return Err(EngineError::NoFadeSlot);
        };

        let delta = target - current;
        *slot = Some(Fade {
            sound,
            param,
            current,
            counter: ticks,
            length: ticks,
            slope: delta / ticks,
            slope_mod: delta.abs() % ticks,
            overflow: 0,
            nudge: if delta < 0 { -1 } else { 1 },
        });
        Ok(FadeStart::Started)
    }

    /// Cancel fades matching `sound` and `param`; `None` matches anything.
    pub fn clear(&mut self, sound: Option<SoundId>, param: Option<ParamId>) {
        for slot in &mut self.slots {
            if let Some(fade) = slot {
                if sound.map_or(true, |s| s == fade.sound) && param.map_or(true, |p| p == fade.param) {
                    *slot = None;
                }
            }
        }
    }

    /// Move fades of `old` over to `new`.
    pub fn rekey(&mut self, old: SoundId, new: SoundId) {
        for fade in self.slots.iter_mut().flatten() {
            if fade.sound == old {
                fade.sound = new;
            }
        }
    }

    pub fn is_fading(&self, sound: SoundId, param: ParamId) -> bool {
        self.find(sound, param).is_some()
    }

    pub fn find(&self, sound: SoundId, param: ParamId) -> Option<&Fade> {
        self.slots
            .iter()
            .flatten()
            .find(|f| f.sound == sound && f.param == param)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Advance every fade one tick.
    ///
    /// Values are pushed every [`FADE_PUSH_INTERVAL`] ticks and on the last
    /// tick; a volume fade that lands on zero stops its sound instead.
    pub fn tick(&mut self, mut push: impl FnMut(FadePush)) {
        for slot in &mut self.slots {
            let Some(fade) = slot else {
                continue;
            };
            let changed = fade.step();
            let done = fade.counter <= 0;
            if (changed && fade.counter % FADE_PUSH_INTERVAL == 0) || done {
                if fade.param == ParamId::Volume && fade.current == 0 {
                    push(FadePush::Stop(fade.sound));
                } else {
                    push(FadePush::Set { sound: fade.sound, param: fade.param, value: fade.current });
                }
            }
            if done {
                *slot = None;
            }
        }
    }

    /// Copy of every slot, for save data.
    pub fn slots(&self) -> &[Option<Fade>; MAX_FADES] {
        &self.slots
    }

    pub fn restore(&mut self, slots: [Option<Fade>; MAX_FADES]) {
        self.slots = slots;
    }
}
