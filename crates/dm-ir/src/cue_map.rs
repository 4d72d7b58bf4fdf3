//! Structured cue map.
//!
//! A cue map is the parsed form of the `MAP ` block list that travels with
//! an audio stream. Every block carries the logical byte offset in the
//! decoded stream at which it takes effect; blocks are kept in file order.

use alloc::vec::Vec;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

use crate::format::AudioFormat;

/// Longest marker text a `TEXT` block or trigger may carry.
pub const MAX_MARKER_LEN: usize = 255;

/// Bounded marker string.
pub type MarkerText = ArrayString<MAX_MARKER_LEN>;

/// What a block does when the playback cursor reaches it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEvent {
    /// `FRMT`: switch the current PCM format.
    Format(AudioFormat),
    /// `REGN`: `length` playable bytes start here.
    Region { length: u32 },
    /// `JUMP`: branch to `dest` if the track hook matches `hook_id`.
    Jump { dest: u32, hook_id: i32, fade_ms: u32 },
    /// `STOP`: end of the sound.
    Stop,
    /// `TEXT`: fire triggers waiting on this marker.
    Text(MarkerText),
    /// `SYNC`: lip-sync side channel, captured by the track.
    Sync(Vec<u8>),
}

/// One block of a cue map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapBlock {
    /// Logical byte offset in the decoded stream.
    pub offset: u32,
    pub event: MapEvent,
}

impl MapBlock {
    pub fn new(offset: u32, event: MapEvent) -> Self {
        Self { offset, event }
    }
}

/// An immutable, already-normalized cue map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CueMap {
    blocks: Vec<MapBlock>,
}

impl CueMap {
    pub fn new(blocks: Vec<MapBlock>) -> Self {
        Self { blocks }
    }

    /// Map for plain PCM without an embedded cue map: one format, one
    /// region covering the whole data, then a stop.
    pub fn linear(format: AudioFormat, length: u32) -> Self {
        Self::new(alloc::vec![
            MapBlock::new(0, MapEvent::Format(format)),
            MapBlock::new(0, MapEvent::Region { length }),
            MapBlock::new(length, MapEvent::Stop),
        ])
    }

    pub fn blocks(&self) -> &[MapBlock] {
        &self.blocks
    }

    pub fn get(&self, index: usize) -> Option<&MapBlock> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the first block taking effect at `offset`.
    pub fn first_at(&self, offset: u32) -> Option<usize> {
        self.blocks.iter().position(|b| b.offset == offset)
    }

    /// Index of the `REGN` whose span contains `offset`, with the bytes
    /// left in it from `offset` on.
    pub fn region_containing(&self, offset: u32) -> Option<(usize, u32)> {
        self.blocks.iter().enumerate().find_map(|(i, b)| match b.event {
            MapEvent::Region { length }
                if b.offset <= offset && offset < b.offset.saturating_add(length) =>
            {
                Some((i, b.offset + length - offset))
            }
            _ => None,
        })
    }

    /// The format in effect at block `index`: the last `FRMT` before it.
    pub fn format_before(&self, index: usize) -> Option<AudioFormat> {
        self.blocks[..index.min(self.blocks.len())]
            .iter()
            .rev()
            .find_map(|b| match b.event {
                MapEvent::Format(fmt) => Some(fmt),
                _ => None,
            })
    }

    /// `JUMP` blocks whose offset lies in `(after, up_to]`, in map order.
    pub fn jumps_between(
        &self,
        after: u32,
        up_to: u32,
    ) -> impl Iterator<Item = (usize, &MapBlock)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(_, b)| {
                matches!(b.event, MapEvent::Jump { .. }) && b.offset > after && b.offset <= up_to
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> CueMap {
        let fmt = AudioFormat::new(16, 22050, 2);
        CueMap::new(alloc::vec![
            MapBlock::new(0, MapEvent::Format(fmt)),
            MapBlock::new(0, MapEvent::Region { length: 1000 }),
            MapBlock::new(1000, MapEvent::Jump { dest: 0, hook_id: 3, fade_ms: 50 }),
            MapBlock::new(1000, MapEvent::Region { length: 500 }),
            MapBlock::new(1500, MapEvent::Stop),
        ])
    }

    #[test]
    fn first_at_picks_earliest_block_in_map_order() {
        let map = sample_map();
        assert_eq!(map.first_at(0), Some(0));
        assert_eq!(map.first_at(1000), Some(2));
        assert_eq!(map.first_at(1500), Some(4));
        assert_eq!(map.first_at(7), None);
    }

    #[test]
    fn region_containing_reports_remaining_bytes() {
        let map = sample_map();
        assert_eq!(map.region_containing(0), Some((1, 1000)));
        assert_eq!(map.region_containing(999), Some((1, 1)));
        assert_eq!(map.region_containing(1200), Some((3, 300)));
        assert_eq!(map.region_containing(1500), None);
    }

    #[test]
    fn format_before_finds_last_frmt() {
        let map = sample_map();
        assert_eq!(map.format_before(0), None);
        assert_eq!(map.format_before(3), Some(AudioFormat::new(16, 22050, 2)));
    }

    #[test]
    fn jumps_between_is_half_open() {
        let map = sample_map();
        assert_eq!(map.jumps_between(0, 999).count(), 0);
        assert_eq!(map.jumps_between(0, 1000).count(), 1);
        assert_eq!(map.jumps_between(1000, 2000).count(), 0);
    }

    #[test]
    fn linear_map_spans_data() {
        let map = CueMap::linear(AudioFormat::new(8, 11025, 1), 4410);
        assert_eq!(map.len(), 3);
        assert_eq!(map.region_containing(0), Some((1, 4410)));
        assert_eq!(map.get(2).map(|b| &b.event), Some(&MapEvent::Stop));
    }
}
