//! Cue map interpreter.
//!
//! Walks the events of a [`CueMap`] from a logical offset, applying the
//! hook rule at `JUMP` blocks, and scans buffered data ahead of playback for
//! jumps that can be prepared before the cursor gets there.

use dm_ir::{AudioFormat, CueMap, MapEvent, MarkerText};

use crate::error::EngineError;

/// Track hook value that takes a hook-0 jump once.
pub const HOOK_WILDCARD: i32 = 128;

/// Decide whether a `JUMP` with `block_hook` is taken, consuming the
/// track's hook on a match.
///
/// A non-zero block hook matches only an equal track hook. A zero block
/// hook matches only the wildcard hook 128. Non-matches never consume.
pub fn check_hook(track_hook: &mut i32, block_hook: i32) -> bool {
    if peek_hook(*track_hook, block_hook) {
        *track_hook = 0;
        true
    } else {
        false
    }
}

/// [`check_hook`] without consuming.
pub fn peek_hook(track_hook: i32, block_hook: i32) -> bool {
    if block_hook != 0 {
        track_hook == block_hook
    } else {
        track_hook == HOOK_WILDCARD
    }
}

/// One event produced by [`MapWalker::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapStep<'a> {
    Format(AudioFormat),
    /// Stream this many bytes; the walker now sits at the region's end.
    Region(u32),
    Text(&'a MarkerText),
    Sync(&'a [u8]),
    /// Taken jump; the walker now sits at `dest`.
    Jump { index: usize, dest: u32, fade_ms: u32 },
    Stop,
}

/// Cursor over the blocks taking effect at one logical offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapWalker {
    offset: u32,
    next: Option<usize>,
}

impl MapWalker {
    pub fn at(offset: u32) -> Self {
        Self { offset, next: None }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Next event at the current offset.
    ///
    /// Zero-length regions and untaken jumps are skipped. A jump whose block
    /// index equals `predicted` was already decided during prefetch and is
    /// taken without consulting the hook.
    pub fn step<'a>(
        &mut self,
        map: &'a CueMap,
        hook: &mut i32,
        predicted: Option<usize>,
    ) -> Result<MapStep<'a>, EngineError> {
        loop {
            let index = match self.next {
                Some(i) => i,
                None => map
                    .first_at(self.offset)
                    .ok_or(EngineError::Navigation("no map event at offset"))?,
            };
            let block = map
                .get(index)
                .filter(|b| b.offset == self.offset)
                .ok_or(EngineError::Navigation("map events end without a region"))?;
            self.next = Some(index + 1);

            match &block.event {
                MapEvent::Format(format) => return Ok(MapStep::Format(*format)),
                MapEvent::Region { length } => {
                    if *length == 0 {
                        continue;
                    }
                    self.offset += length;
                    self.next = None;
                    return Ok(MapStep::Region(*length));
                }
                MapEvent::Jump { dest, hook_id, fade_ms } => {
                    if predicted == Some(index) || check_hook(hook, *hook_id) {
                        self.offset = *dest;
                        self.next = None;
                        return Ok(MapStep::Jump { index, dest: *dest, fade_ms: *fade_ms });
                    }
                }
                MapEvent::Stop => return Ok(MapStep::Stop),
                MapEvent::Text(text) => return Ok(MapStep::Text(text)),
                MapEvent::Sync(data) => return Ok(MapStep::Sync(data)),
            }
        }
    }
}

/// A jump found ahead of playback, sized and ready to split zones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JumpPlan {
    pub index: usize,
    /// Logical offset of the `JUMP` block.
    pub at: u32,
    pub dest: u32,
    /// Bytes of old material to crossfade, block aligned.
    pub fade: u32,
}

/// True if some non-empty region ends exactly at `offset`; only jumps there
/// are ever reached by the walker.
pub fn ends_region(map: &CueMap, offset: u32) -> bool {
    map.blocks().iter().any(|b| match b.event {
        MapEvent::Region { length } => length > 0 && b.offset + length == offset,
        _ => false,
    })
}

/// Fade size for a jump: `fade_ms` of `format`, capped to `available`.
pub fn fade_size(format: AudioFormat, fade_ms: u32, available: u32) -> u32 {
    format.fade_bytes(fade_ms).min(format.align_down(available))
}

/// Find the first jump in `(start, end]` that `hook` would take.
///
/// The fade must already be buffered: an oversized fade is rejected, unless
/// the source is exhausted (`paused`) and no more data will come, in which
/// case it is capped.
pub fn predict_jump(
    map: &CueMap,
    start: u32,
    end: u32,
    hook: i32,
    paused: bool,
) -> Option<JumpPlan> {
    for (index, block) in map.jumps_between(start, end) {
        let MapEvent::Jump { dest, hook_id, fade_ms } = block.event else {
            continue;
        };
        if !ends_region(map, block.offset) || !peek_hook(hook, hook_id) {
            continue;
        }
        let format = map.format_before(index)?;
        let available = end - block.offset;
        let wanted = format.fade_bytes(fade_ms);
        let fade = if wanted <= available {
            wanted
        } else if paused {
            format.align_down(available)
        } else {
            return None;
        };
        return Some(JumpPlan { index, at: block.offset, dest, fade });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_ir::MapBlock;

    fn fmt() -> AudioFormat {
        AudioFormat::new(16, 22050, 2)
    }

    fn text(s: &str) -> MarkerText {
        MarkerText::from(s).unwrap()
    }

    /// FRMT, two regions split by a marker, a hooked loop back, then STOP.
    fn song_map() -> CueMap {
        CueMap::new(vec![
            MapBlock::new(0, MapEvent::Format(fmt())),
            MapBlock::new(0, MapEvent::Region { length: 1000 }),
            MapBlock::new(1000, MapEvent::Text(text("bridge"))),
            MapBlock::new(1000, MapEvent::Region { length: 500 }),
            MapBlock::new(1500, MapEvent::Jump { dest: 0, hook_id: 2, fade_ms: 10 }),
            MapBlock::new(1500, MapEvent::Region { length: 0 }),
            MapBlock::new(1500, MapEvent::Stop),
        ])
    }

    #[test]
    fn hook_truth_table() {
        let mut hook = 5;
        assert!(check_hook(&mut hook, 5));
        assert_eq!(hook, 0);

        let mut hook = 5;
        assert!(!check_hook(&mut hook, 3));
        assert_eq!(hook, 5);

        let mut hook = 128;
        assert!(check_hook(&mut hook, 0));
        assert_eq!(hook, 0);

        let mut hook = 7;
        assert!(!check_hook(&mut hook, 0));
        assert_eq!(hook, 7);

        let mut hook = 0;
        assert!(!check_hook(&mut hook, 0));
        let mut hook = 128;
        assert!(!check_hook(&mut hook, 3));
        assert_eq!(hook, 128);
    }

    #[test]
    fn walk_visits_blocks_in_order() {
        let map = song_map();
        let mut hook = 0;
        let mut walker = MapWalker::at(0);
        let mut seen = Vec::new();
        loop {
            match walker.step(&map, &mut hook, None).unwrap() {
                MapStep::Format(f) => seen.push(format!("FRMT {}", f.word_size)),
                MapStep::Region(len) => seen.push(format!("REGN {}", len)),
                MapStep::Text(t) => seen.push(format!("TEXT {}", t)),
                MapStep::Sync(_) => seen.push("SYNC".into()),
                MapStep::Jump { dest, .. } => seen.push(format!("JUMP {}", dest)),
                MapStep::Stop => {
                    seen.push("STOP".into());
                    break;
                }
            }
        }
        assert_eq!(
            seen,
            vec!["FRMT 16", "REGN 1000", "TEXT bridge", "REGN 500", "STOP"]
        );
    }

    #[test]
    fn matching_hook_takes_jump() {
        let map = song_map();
        let mut hook = 2;
        let mut walker = MapWalker::at(1500);
        assert_eq!(
            walker.step(&map, &mut hook, None).unwrap(),
            MapStep::Jump { index: 4, dest: 0, fade_ms: 10 }
        );
        assert_eq!(hook, 0);
        assert_eq!(walker.offset(), 0);
        assert_eq!(walker.step(&map, &mut hook, None).unwrap(), MapStep::Format(fmt()));
        assert_eq!(walker.step(&map, &mut hook, None).unwrap(), MapStep::Region(1000));
        assert_eq!(walker.offset(), 1000);
    }

    #[test]
    fn predicted_jump_ignores_hook() {
        let map = song_map();
        let mut hook = 0;
        let mut walker = MapWalker::at(1500);
        assert!(matches!(
            walker.step(&map, &mut hook, Some(4)).unwrap(),
            MapStep::Jump { dest: 0, .. }
        ));
    }

    #[test]
    fn offset_without_events_is_an_error() {
        let map = song_map();
        let mut hook = 0;
        assert!(MapWalker::at(700).step(&map, &mut hook, None).is_err());
        let bad = CueMap::new(vec![MapBlock::new(0, MapEvent::Format(fmt()))]);
        let mut walker = MapWalker::at(0);
        walker.step(&bad, &mut hook, None).unwrap();
        assert!(walker.step(&bad, &mut hook, None).is_err());
    }

    #[test]
    fn prediction_needs_buffered_fade() {
        let map = song_map();
        // 10 ms of 16-bit stereo at 22050 Hz.
        let fade = fmt().fade_bytes(10);
        assert_eq!(fade, 880);

        assert_eq!(predict_jump(&map, 1000, 1500 + fade, 2, false).map(|p| p.fade), Some(880));
        assert_eq!(predict_jump(&map, 1000, 1500 + 100, 2, false), None);
        assert_eq!(predict_jump(&map, 1000, 1500 + 101, 2, true).map(|p| p.fade), Some(100));
        // The jump is outside `(start, end]`.
        assert_eq!(predict_jump(&map, 1500, 4000, 2, false), None);
        // Wrong hook.
        assert_eq!(predict_jump(&map, 1000, 4000, 3, false), None);
    }

    #[test]
    fn jumps_inside_regions_are_not_predicted() {
        let map = CueMap::new(vec![
            MapBlock::new(0, MapEvent::Format(fmt())),
            MapBlock::new(0, MapEvent::Region { length: 1000 }),
            MapBlock::new(500, MapEvent::Jump { dest: 0, hook_id: 1, fade_ms: 0 }),
            MapBlock::new(1000, MapEvent::Stop),
        ]);
        assert_eq!(predict_jump(&map, 0, 1000, 1, false), None);
    }

    #[test]
    fn fade_size_is_aligned_and_capped() {
        let mono12 = AudioFormat::new(12, 22050, 1);
        assert_eq!(fade_size(mono12, 1000, 100) % 3, 0);
        assert_eq!(fade_size(fmt(), 1000, 1001), 1000);
        assert_eq!(fade_size(fmt(), 0, 1000), 0);
    }
}
