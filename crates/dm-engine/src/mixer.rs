//! Sample-format mixer.
//!
//! Source PCM (8, 12 or 16-bit unsigned, mono or stereo) is scaled through
//! volume/pan amplitude tables and summed into an `i32` accumulator at the
//! output rate. [`Mixer::loop_out`] then soft-limits the sum into the sink
//! format and clears the accumulator for the next feed.

use alloc::vec::Vec;

use dm_ir::AudioFormat;

use crate::config::{OutputConfig, MAX_FEED_FRAMES};

/// Volume steps, 0 (silent) to 16 (full).
pub const VOL_STEPS: usize = 17;
/// Pan positions from -8 (left) to +8 (right).
pub const PAN_RANGE: i32 = 8;

const KNEE: i32 = 24576;
const LIMIT_SHIFT: u32 = 4;
const LIMIT_LEN: usize = 4096;

/// 0..=127 volume to a table row.
pub fn vol_step(vol: i32) -> usize {
    ((vol.clamp(0, 127) * 16 + 63) / 127) as usize
}

/// 0..=127 pan (64 = center) to -8..=8, reaching both extremes.
pub fn pan_step(pan: i32) -> i32 {
    (pan.clamp(0, 127) * 2 * PAN_RANGE + 63) / 127 - PAN_RANGE
}

/// Left and right table rows for a volume and pan.
pub fn channel_steps(vol: i32, pan: i32) -> (usize, usize) {
    let v = vol_step(vol) as i32;
    let p = pan_step(pan);
    let left = v * (PAN_RANGE - p.max(0)) / PAN_RANGE;
    let right = v * (PAN_RANGE + p.min(0)) / PAN_RANGE;
    (left as usize, right as usize)
}

/// Frame count the engine prefers to mix per call for a sink reporting
/// `optimal_bytes` as its buffer size.
pub fn preferred_feed_size(optimal_bytes: u32, output: &OutputConfig) -> u32 {
    let frames = optimal_bytes / output.frame_bytes().max(1) as u32;
    let lo = (output.sample_rate / 100).max(1);
    let hi = (output.sample_rate / 10).clamp(lo, MAX_FEED_FRAMES);
    frames.clamp(lo, hi) & !1
}

/// Table index of sample `chan` of `frame`: 0..256 for 8-bit, 0..4096
/// otherwise (16-bit is reduced to 12 bits).
#[inline]
fn sample_index(src: &[u8], word_size: u8, channels: usize, frame: usize, chan: usize) -> usize {
    let k = frame * channels + chan;
    match word_size {
        8 => src[k] as usize,
        12 => {
            let base = (k / 2) * 3;
            if k % 2 == 0 {
                ((src[base + 1] as usize & 0x0F) << 8) | src[base] as usize
            } else {
                ((src[base + 1] as usize & 0xF0) << 4) | src[base + 2] as usize
            }
        }
        _ => (((src[2 * k] as usize) << 8) | src[2 * k + 1] as usize) >> 4,
    }
}

#[derive(Clone, Copy)]
enum Resample {
    Same,
    Decimate,
    Duplicate,
    Ratio,
}

pub struct Mixer {
    out_channels: usize,
    out_word: u8,
    accum: Vec<i32>,
    amp8: Vec<i32>,
    amp12: Vec<i32>,
    soft_limit: Vec<i16>,
}

impl Mixer {
    pub fn new(output: &OutputConfig) -> Self {
        let mut amp8 = Vec::with_capacity(VOL_STEPS * 256);
        let mut amp12 = Vec::with_capacity(VOL_STEPS * 4096);
        for step in 0..VOL_STEPS as i32 {
            amp8.extend((0..256).map(|s| ((s - 128) << 8) * step / 16));
            amp12.extend((0..4096).map(|s| ((s - 2048) << 4) * step / 16));
        }
        let headroom = (i16::MAX as i32 - KNEE) as f64;
        let soft_limit = (0..LIMIT_LEN)
            .map(|i| {
                let over = (i << LIMIT_SHIFT) as f64;
                (KNEE as f64 + headroom * libm::tanh(over / headroom)) as i16
            })
            .collect();
        Self {
            out_channels: output.channels.clamp(1, 2) as usize,
            out_word: output.word_size,
            accum: vec![0; MAX_FEED_FRAMES as usize * 2],
            amp8,
            amp12,
            soft_limit,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn out_frame_bytes(&self) -> usize {
        self.out_channels * (self.out_word as usize / 8)
    }

    #[inline]
    fn amp(&self, word_size: u8, step: usize, sample: usize) -> i32 {
        if word_size == 8 {
            self.amp8[step * 256 + sample]
        } else {
            self.amp12[step * 4096 + sample]
        }
    }

    #[inline]
    fn accumulate(&mut self, src: &[u8], format: AudioFormat, frame: usize, out: usize, steps: (usize, usize, usize)) {
        let (left, right, both) = steps;
        let word = format.word_size;
        let ch = format.channels as usize;
        match (ch, self.out_channels) {
            (1, 2) => {
                let s = sample_index(src, word, 1, frame, 0);
                self.accum[2 * out] += self.amp(word, left, s);
                self.accum[2 * out + 1] += self.amp(word, right, s);
            }
            (2, 2) => {
                let l = sample_index(src, word, 2, frame, 0);
                let r = sample_index(src, word, 2, frame, 1);
                self.accum[2 * out] += self.amp(word, left, l);
                self.accum[2 * out + 1] += self.amp(word, right, r);
            }
            (1, _) => {
                let s = sample_index(src, word, 1, frame, 0);
                self.accum[out] += self.amp(word, both, s);
            }
            _ => {
                let l = sample_index(src, word, 2, frame, 0);
                let r = sample_index(src, word, 2, frame, 1);
                self.accum[out] += (self.amp(word, both, l) + self.amp(word, both, r)) / 2;
            }
        }
    }

    /// Add `in_frames` frames of `src` to output frames
    /// `out_offset..out_offset + out_span`, resampling by nearest neighbour.
    pub fn mix(
        &mut self,
        src: &[u8],
        in_frames: u32,
        format: AudioFormat,
        out_span: u32,
        out_offset: u32,
        volume: i32,
        pan: i32,
    ) {
        let out_span = out_span.min(MAX_FEED_FRAMES.saturating_sub(out_offset));
        let in_frames = in_frames.min(format.bytes_to_frames(src.len() as u32));
        if in_frames == 0 || out_span == 0 || !format.is_valid() {
            return;
        }
        let (left, right) = channel_steps(volume, pan);
        let both = vol_step(volume);
        if both == 0 {
            return;
        }
        let steps = (left, right, both);
        let mode = if in_frames == out_span {
            Resample::Same
        } else if in_frames == 2 * out_span {
            Resample::Decimate
        } else if 2 * in_frames == out_span {
            Resample::Duplicate
        } else {
            Resample::Ratio
        };

        let base = out_offset as usize;
        let span = out_span as usize;
        match mode {
            Resample::Same => {
                for i in 0..span {
                    self.accumulate(src, format, i, base + i, steps);
                }
            }
            Resample::Decimate => {
                for i in 0..span {
                    self.accumulate(src, format, 2 * i, base + i, steps);
                }
            }
            Resample::Duplicate => {
                for i in 0..span {
                    self.accumulate(src, format, i / 2, base + i, steps);
                }
            }
            Resample::Ratio => {
                let mut frame = 0;
                let mut residue = 0;
                for i in 0..span {
                    self.accumulate(src, format, frame, base + i, steps);
                    residue += in_frames;
                    while residue >= out_span {
                        residue -= out_span;
                        frame += 1;
                    }
                }
            }
        }
    }

    #[inline]
    fn limit(&self, v: i32) -> i16 {
        let mag = v.unsigned_abs();
        let out = if mag <= KNEE as u32 {
            mag as i16
        } else {
            let i = ((mag - KNEE as u32) >> LIMIT_SHIFT) as usize;
            self.soft_limit[i.min(LIMIT_LEN - 1)]
        };
        if v < 0 {
            -out
        } else {
            out
        }
    }

    /// Quantize `frames` accumulated frames into `dest` in the output
    /// format and clear them. Returns bytes written.
    pub fn loop_out(&mut self, dest: &mut [u8], frames: u32) -> usize {
        let frame_bytes = self.out_frame_bytes();
        let frames = (frames as usize)
            .min(MAX_FEED_FRAMES as usize)
            .min(dest.len() / frame_bytes.max(1));
        let samples = frames * self.out_channels;
        for i in 0..samples {
            let s = self.limit(self.accum[i]);
            if self.out_word == 8 {
                dest[i] = ((s >> 8) + 128) as u8;
            } else {
                dest[2 * i..2 * i + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        self.accum[..samples].fill(0);
        frames * frame_bytes
    }

    /// Raw accumulator contents, for inspection.
    pub fn accumulator(&self, frames: usize) -> &[i32] {
        &self.accum[..frames * self.out_channels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo16() -> Mixer {
        Mixer::new(&OutputConfig::default())
    }

    fn mono8_out() -> Mixer {
        Mixer::new(&OutputConfig { channels: 1, word_size: 8, ..Default::default() })
    }

    #[test]
    fn volume_and_pan_steps() {
        assert_eq!(vol_step(0), 0);
        assert_eq!(vol_step(127), 16);
        assert_eq!(vol_step(64), 8);
        assert_eq!(pan_step(64), 0);
        assert_eq!(pan_step(0), -8);
        assert_eq!(pan_step(127), 8);
        assert_eq!(pan_step(32), -4);
        assert_eq!(pan_step(96), 4);
        assert_eq!(channel_steps(127, 64), (16, 16));
        assert_eq!(channel_steps(127, 0), (16, 0));
        assert_eq!(channel_steps(127, 127), (0, 16));
        assert_eq!(channel_steps(64, 127), (0, 8));
        // Every step left of center is matched by one right of it.
        for pan in 0..=127 {
            let (l, r) = channel_steps(127, pan);
            assert_eq!(channel_steps(127, 127 - pan), (r, l), "pan {pan}");
        }
    }

    #[test]
    fn silent_source_adds_nothing() {
        let mut m = stereo16();
        let fmt = AudioFormat::new(8, 22050, 1);
        m.mix(&[0x80; 8], 8, fmt, 8, 0, 127, 64);
        assert!(m.accumulator(8).iter().all(|&v| v == 0));
    }

    #[test]
    fn mono8_full_volume_center() {
        let mut m = stereo16();
        let fmt = AudioFormat::new(8, 22050, 1);
        m.mix(&[0xC0, 0x40], 2, fmt, 2, 0, 127, 64);
        assert_eq!(m.accumulator(2), &[0x4000, 0x4000, -0x4000, -0x4000]);
    }

    #[test]
    fn mixing_accumulates() {
        let mut m = stereo16();
        let fmt = AudioFormat::new(8, 22050, 1);
        m.mix(&[0xC0], 1, fmt, 1, 0, 127, 64);
        m.mix(&[0xC0], 1, fmt, 1, 0, 127, 64);
        assert_eq!(m.accumulator(1), &[0x8000, 0x8000]);
    }

    #[test]
    fn twelve_bit_pairs_unpack() {
        // Low nibble of the middle byte belongs to the first sample.
        let src = [0x23, 0x51, 0x56];
        assert_eq!(sample_index(&src, 12, 1, 0, 0), 0x123);
        assert_eq!(sample_index(&src, 12, 1, 1, 0), 0x556);
        assert_eq!(sample_index(&src, 12, 2, 0, 1), 0x556);
    }

    #[test]
    fn sixteen_bit_is_big_endian_offset_binary() {
        let src = [0xFF, 0xF0, 0x80, 0x00];
        assert_eq!(sample_index(&src, 16, 1, 0, 0), 0xFFF);
        assert_eq!(sample_index(&src, 16, 1, 1, 0), 0x800);
    }

    #[test]
    fn duplicate_and_decimate_paths() {
        let fmt = AudioFormat::new(8, 11025, 1);
        let mut m = mono8_out();
        m.mix(&[0x81, 0x82], 2, fmt, 4, 0, 127, 64);
        assert_eq!(m.accumulator(4), &[256, 256, 512, 512]);

        let mut m = mono8_out();
        m.mix(&[0x81, 0x82, 0x83, 0x84], 4, fmt, 2, 0, 127, 64);
        assert_eq!(m.accumulator(2), &[256, 768]);
    }

    #[test]
    fn arbitrary_ratio_uses_running_remainder() {
        let fmt = AudioFormat::new(8, 11025, 1);
        let mut m = mono8_out();
        m.mix(&[0x81, 0x82, 0x83], 3, fmt, 5, 0, 127, 64);
        // floor(i * 3 / 5) for i in 0..5 = 0 0 1 1 2
        assert_eq!(m.accumulator(5), &[256, 256, 512, 512, 768]);
    }

    #[test]
    fn stereo_source_to_mono_output_averages() {
        let fmt = AudioFormat::new(8, 22050, 2);
        let mut m = mono8_out();
        m.mix(&[0x90, 0x70], 1, fmt, 1, 0, 127, 64);
        assert_eq!(m.accumulator(1), &[0]);
    }

    #[test]
    fn out_offset_places_frames() {
        let fmt = AudioFormat::new(8, 22050, 1);
        let mut m = mono8_out();
        m.mix(&[0x81], 1, fmt, 1, 3, 127, 64);
        assert_eq!(m.accumulator(4), &[0, 0, 0, 256]);
    }

    #[test]
    fn loop_out_quantizes_and_clears() {
        let fmt = AudioFormat::new(8, 22050, 1);
        let mut m = stereo16();
        m.mix(&[0xC0], 1, fmt, 1, 0, 127, 64);
        let mut out = [0u8; 4];
        assert_eq!(m.loop_out(&mut out, 1), 4);
        assert_eq!(out, [0x00, 0x40, 0x00, 0x40]);
        assert!(m.accumulator(1).iter().all(|&v| v == 0));

        let mut m = mono8_out();
        m.mix(&[0xC0], 1, fmt, 1, 0, 127, 64);
        let mut out = [0u8; 1];
        m.loop_out(&mut out, 1);
        assert_eq!(out, [0xC0]);
    }

    #[test]
    fn soft_limit_is_bounded_and_monotonic() {
        let m = stereo16();
        let mut prev = 0;
        for v in (0..200_000).step_by(97) {
            let s = m.limit(v);
            assert!(s >= prev);
            prev = s;
        }
        assert!(m.limit(i32::MAX) <= i16::MAX);
        assert_eq!(m.limit(-1000), -1000);
        assert!(m.limit(i32::MIN + 1) >= -i16::MAX);
    }

    #[test]
    fn preferred_feed_is_clamped() {
        let out = OutputConfig::default();
        assert_eq!(preferred_feed_size(4096, &out), 1024);
        assert_eq!(preferred_feed_size(16, &out), 220);
        assert_eq!(preferred_feed_size(1 << 20, &out), 2204);
    }
}
