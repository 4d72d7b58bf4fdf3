//! Crossfade buffers and the crossfade law.
//!
//! When a jump or stream switch happens, a slice of the old material is
//! copied into a pooled fade buffer and played under the new material with
//! a falling gain. The new material gets the complementary gain.

use alloc::vec::Vec;

use dm_ir::AudioFormat;
use tracing::warn;

use crate::config::FadeBufferConfig;

/// Fade volume at the start of a crossfade, 16.16 fixed point.
pub const FADE_VOL_MAX: i32 = 127 << 16;

/// Gains `(old, new)` for a track at `track_vol` while the old material's
/// envelope is at `fade_vol`.
///
/// `old + new` stays within one step of `track_vol`.
pub fn crossfade_gains(track_vol: i32, fade_vol: i32) -> (i32, i32) {
    let old = (fade_vol >> 16).clamp(0, 127);
    (track_vol * old / 128, track_vol * (128 - old) / 128)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeBufferKind {
    Large,
    Small,
}

/// A borrowed pool buffer holding `len` bytes of old material.
#[derive(Debug)]
pub struct FadeBuffer {
    kind: FadeBufferKind,
    data: Vec<u8>,
    len: u32,
}

impl FadeBuffer {
    pub fn kind(&self) -> FadeBufferKind {
        self.kind
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Writable view of the first `len` bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }

    /// Shorten the valid data, for a source that yielded fewer bytes.
    pub fn truncate(&mut self, len: u32) {
        self.len = self.len.min(len);
    }
}

/// Preallocated large and small fade buffers.
pub struct FadeBufferPool {
    large: Vec<Vec<u8>>,
    small: Vec<Vec<u8>>,
    large_size: u32,
    small_size: u32,
}

impl FadeBufferPool {
    pub fn new(config: &FadeBufferConfig) -> Self {
        let make = |count: usize, size: u32| {
            let mut v = Vec::with_capacity(count);
            v.extend((0..count).map(|_| vec![0u8; size as usize]));
            v
        };
        Self {
            large: make(config.large_count, config.large_size),
            small: make(config.small_count, config.small_size),
            large_size: config.large_size,
            small_size: config.small_size,
        }
    }

    pub fn free_count(&self) -> (usize, usize) {
        (self.large.len(), self.small.len())
    }

    /// Borrow a buffer for `size` bytes.
    ///
    /// Sizes beyond a small buffer prefer a large one and fall back to a
    /// truncated small one; small sizes prefer a small buffer. Returns
    /// `None` when nothing is free.
    pub fn allocate(&mut self, size: u32) -> Option<FadeBuffer> {
        let order = if size > self.small_size {
            [FadeBufferKind::Large, FadeBufferKind::Small]
        } else {
            [FadeBufferKind::Small, FadeBufferKind::Large]
        };
        for kind in order {
            let (free, cap) = match kind {
                FadeBufferKind::Large => (&mut self.large, self.large_size),
                FadeBufferKind::Small => (&mut self.small, self.small_size),
            };
            if let Some(data) = free.pop() {
                if size > cap {
                    warn!(size, cap, "crossfade truncated to fit fade buffer");
                }
                return Some(FadeBuffer { kind, data, len: size.min(cap) });
            }
        }
        warn!(size, "no fade buffer free, jumping without crossfade");
        None
    }

    pub fn release(&mut self, buffer: FadeBuffer) {
        match buffer.kind {
            FadeBufferKind::Large => self.large.push(buffer.data),
            FadeBufferKind::Small => self.small.push(buffer.data),
        }
    }
}

/// Old material fading out under the live region.
#[derive(Debug)]
pub struct Crossfade {
    buffer: FadeBuffer,
    /// Format of the old material.
    pub format: AudioFormat,
    pos: u32,
    fade_vol: i32,
    /// Per-call decrement; zero until the first call sizes it.
    slope: i32,
    /// Old-material bytes played so far.
    sync_delta: u32,
}

impl Crossfade {
    pub fn new(buffer: FadeBuffer, format: AudioFormat) -> Self {
        Self { buffer, format, pos: 0, fade_vol: FADE_VOL_MAX, slope: 0, sync_delta: 0 }
    }

    pub fn remaining(&self) -> u32 {
        self.buffer.len() - self.pos
    }

    pub fn fade_vol(&self) -> i32 {
        self.fade_vol
    }

    pub fn sync_delta(&self) -> u32 {
        self.sync_delta
    }

    pub fn gains(&self, track_vol: i32) -> (i32, i32) {
        crossfade_gains(track_vol, self.fade_vol)
    }

    /// Up to `len` unplayed bytes of old material.
    pub fn material(&self, len: u32) -> &[u8] {
        let end = (self.pos + len.min(self.remaining())) as usize;
        &self.buffer.bytes()[self.pos as usize..end]
    }

    /// Account for one feed call that played `played` bytes of old material
    /// out of a nominal `per_call` bytes.
    ///
    /// The slope is fixed on the first call so the envelope reaches zero
    /// after half of the remaining material.
    pub fn advance(&mut self, played: u32, per_call: u32) {
        if self.slope == 0 {
            let half = self.remaining() / 2;
            let calls = half.div_ceil(per_call.max(1)).max(1);
            self.slope = (FADE_VOL_MAX / calls as i32).max(1);
        }
        let played = played.min(self.remaining());
        self.pos += played;
        self.sync_delta += played;
        self.fade_vol = (self.fade_vol - self.slope).max(0);
    }

    pub fn is_done(&self) -> bool {
        self.fade_vol <= 0 || self.remaining() == 0
    }

    pub fn into_buffer(self) -> FadeBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FadeBufferPool {
        FadeBufferPool::new(&FadeBufferConfig {
            large_count: 1,
            large_size: 1000,
            small_count: 2,
            small_size: 100,
        })
    }

    #[test]
    fn gains_are_conserved() {
        for track_vol in [1, 64, 100, 127] {
            let mut fade_vol = FADE_VOL_MAX;
            while fade_vol > 0 {
                let (old, new) = crossfade_gains(track_vol, fade_vol);
                let sum = old + new;
                assert!(sum == track_vol || sum == track_vol - 1, "vol {} fade {}", track_vol, fade_vol);

                fade_vol -= 0x1_0000 / 3;
            }
        }
    }

    #[test]
    fn normalized_gains_sum_to_full_scale() {
        for track_vol in [127, 128] {
            let mut fade_vol = FADE_VOL_MAX;
            while fade_vol > 0 {
                let (_, new) = crossfade_gains(track_vol, fade_vol);
                let old_gain = fade_vol >> 16;
                let new_norm = new * 128 / track_vol;
                assert!((old_gain + new_norm - 128).abs() <= 1, "fade {}", fade_vol);
                fade_vol -= 0x1_0000 / 3;
            }
        }
    }

    #[test]
    fn gains_run_from_old_to_new() {
        assert_eq!(crossfade_gains(128, FADE_VOL_MAX), (127, 1));
        assert_eq!(crossfade_gains(128, 0), (0, 128));
    }

    #[test]
    fn large_falls_back_to_truncated_small() {
        let mut p = pool();
        let a = p.allocate(500).unwrap();
        assert_eq!((a.kind(), a.len()), (FadeBufferKind::Large, 500));
        let b = p.allocate(500).unwrap();
        assert_eq!((b.kind(), b.len()), (FadeBufferKind::Small, 100));
        let c = p.allocate(50).unwrap();
        assert_eq!((c.kind(), c.len()), (FadeBufferKind::Small, 50));
        assert!(p.allocate(10).is_none());

        p.release(a);
        p.release(b);
        p.release(c);
        assert_eq!(p.free_count(), (1, 2));
    }

    #[test]
    fn small_request_uses_large_when_smalls_gone() {
        let mut p = pool();
        let _s1 = p.allocate(10).unwrap();
        let _s2 = p.allocate(10).unwrap();
        assert_eq!(p.allocate(10).unwrap().kind(), FadeBufferKind::Large);
    }

    #[test]
    fn envelope_reaches_zero_after_half() {
        let mut p = pool();
        let buffer = p.allocate(800).unwrap();
        let mut fade = Crossfade::new(buffer, AudioFormat::default());
        let mut calls = 0;
        while !fade.is_done() {
            fade.advance(100, 100);
            calls += 1;
        }
        // 400 bytes at 100 per call.
        assert_eq!(calls, 4);
        assert_eq!(fade.sync_delta(), 400);
        assert_eq!(fade.remaining(), 400);
    }
}
