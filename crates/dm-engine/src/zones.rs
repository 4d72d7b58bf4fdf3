//! Stream zones: the logical ranges of sound data sitting in a ring buffer.
//!
//! A ring prefetches ahead of the playback cursor, and after a predicted
//! jump the buffered bytes are no longer one contiguous logical range. Each
//! zone records where its bytes belong in the sound; zones are in ring
//! order, the head being the one playback reads from.

use tracing::warn;

use crate::pool::{Chain, Pool};

/// Zones available to all dispatches together.
pub const MAX_ZONES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamZone {
    /// Logical offset of the first buffered byte.
    pub offset: u32,
    /// Buffered bytes not yet played.
    pub size: u32,
    /// Material that only plays as the old side of a crossfade.
    pub fading: bool,
}

impl StreamZone {
    pub fn new(offset: u32) -> Self {
        Self { offset, size: 0, fading: false }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

pub type ZonePool = Pool<StreamZone>;

/// Zone chain of one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneList {
    chain: Chain,
}

impl ZoneList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn head<'a>(&self, pool: &'a ZonePool) -> Option<&'a StreamZone> {
        self.chain.head().and_then(|i| pool.get(i))
    }

    pub fn tail<'a>(&self, pool: &'a ZonePool) -> Option<&'a StreamZone> {
        self.chain.tail().and_then(|i| pool.get(i))
    }

    /// Sum of all zone sizes; equals the ring's buffered bytes.
    pub fn total(&self, pool: &ZonePool) -> u32 {
        pool.iter(&self.chain).map(|(_, z)| z.size).sum()
    }

    pub fn iter<'a>(&self, pool: &'a ZonePool) -> impl Iterator<Item = &'a StreamZone> + 'a {
        pool.iter(&self.chain).map(|(_, z)| z)
    }

    /// Release every zone.
    pub fn clear(&mut self, pool: &mut ZonePool) {
        pool.clear_chain(&mut self.chain);
    }

    /// Replace all zones with one zone at `offset` holding `size` bytes.
    pub fn reset(&mut self, pool: &mut ZonePool, offset: u32, size: u32) -> bool {
        self.clear(pool);
        let zone = StreamZone { offset, size, fading: false };
        if pool.push_back(&mut self.chain, zone).is_err() {
            warn!("stream zone pool exhausted");
            return false;
        }
        true
    }

    /// Account for `n` freshly loaded bytes.
    pub fn grow_tail(&mut self, pool: &mut ZonePool, n: u32) {
        if let Some(tail) = self.chain.tail().and_then(|i| pool.get_mut(i)) {
            tail.size += n;
        }
    }

    /// Account for `n` played bytes. An emptied head zone is dropped when
    /// another zone follows it.
    pub fn consume_head(&mut self, pool: &mut ZonePool, n: u32) {
        let Some(head) = self.chain.head() else {
            return;
        };
        let Some(zone) = pool.get_mut(head) else {
            return;
        };
        let n = n.min(zone.size);
        zone.offset += n;
        zone.size -= n;
        if zone.size == 0 && pool.next(head).is_some() {
            pool.remove(&mut self.chain, head);
        }
    }

    /// Drop the head zone outright, returning it.
    pub fn pop_head(&mut self, pool: &mut ZonePool) -> Option<StreamZone> {
        let head = self.chain.head()?;
        pool.remove(&mut self.chain, head)
    }

    /// Split the tail zone for a predicted jump at `jump` to `dest`.
    ///
    /// Leaves `[tail.offset, jump)`, a fading zone `[jump, jump + fade)` and
    /// an empty zone at `dest`. Returns the number of loaded bytes past the
    /// fade zone that no longer belong to any zone and must be trimmed from
    /// the ring, or `None` if the split is impossible.
    pub fn split_for_jump(
        &mut self,
        pool: &mut ZonePool,
        jump: u32,
        fade: u32,
        dest: u32,
    ) -> Option<u32> {
        let tail_index = self.chain.tail()?;
        let tail = *pool.get(tail_index)?;
        if tail.fading || jump < tail.offset || jump + fade > tail.end() {
            return None;
        }
        if pool.free_count() < 2 {
            warn!("stream zone pool exhausted, jump will not be predicted");
            return None;
        }

        let excess = tail.end() - (jump + fade);
        if let Some(zone) = pool.get_mut(tail_index) {
            zone.size = jump - tail.offset;
        }
        let fade_zone = StreamZone { offset: jump, size: fade, fading: true };
        let fade_index = pool.insert_after(&mut self.chain, tail_index, fade_zone).ok()?;
        pool.insert_after(&mut self.chain, fade_index, StreamZone::new(dest)).ok()?;

        // A now-empty remainder zone can go: the fade zone follows it.
        if jump == tail.offset {
            pool.remove(&mut self.chain, tail_index);
        }
        Some(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(list: &ZoneList, pool: &ZonePool) -> Vec<(u32, u32, bool)> {
        list.iter(pool).map(|z| (z.offset, z.size, z.fading)).collect()
    }

    #[test]
    fn grow_and_consume() {
        let mut pool = ZonePool::with_capacity(4);
        let mut list = ZoneList::new();
        assert!(list.reset(&mut pool, 0, 0));
        list.grow_tail(&mut pool, 100);
        list.consume_head(&mut pool, 30);
        assert_eq!(zones(&list, &pool), vec![(30, 70, false)]);
        // The only zone stays even when empty.
        list.consume_head(&mut pool, 70);
        assert_eq!(zones(&list, &pool), vec![(100, 0, false)]);
    }

    #[test]
    fn split_produces_three_zones() {
        let mut pool = ZonePool::with_capacity(8);
        let mut list = ZoneList::new();
        list.reset(&mut pool, 1000, 3000);

        let excess = list.split_for_jump(&mut pool, 2000, 400, 0).unwrap();
        assert_eq!(excess, 1600);
        assert_eq!(
            zones(&list, &pool),
            vec![(1000, 1000, false), (2000, 400, true), (0, 0, false)]
        );
        assert_eq!(list.total(&pool), 1400);

        // New data lands in the destination zone.
        list.grow_tail(&mut pool, 50);
        assert_eq!(list.tail(&pool).unwrap().size, 50);

        // Playing through the remainder exposes the fade zone.
        list.consume_head(&mut pool, 1000);
        assert!(list.head(&pool).unwrap().fading);
        assert_eq!(list.pop_head(&mut pool).unwrap().offset, 2000);
        assert_eq!(list.head(&pool).unwrap().offset, 0);
    }

    #[test]
    fn split_at_zone_start_skips_remainder() {
        let mut pool = ZonePool::with_capacity(8);
        let mut list = ZoneList::new();
        list.reset(&mut pool, 500, 100);
        list.split_for_jump(&mut pool, 500, 40, 8).unwrap();
        assert_eq!(zones(&list, &pool), vec![(500, 40, true), (8, 0, false)]);
    }

    #[test]
    fn split_rejects_unbuffered_fade() {
        let mut pool = ZonePool::with_capacity(8);
        let mut list = ZoneList::new();
        list.reset(&mut pool, 0, 100);
        assert_eq!(list.split_for_jump(&mut pool, 80, 40, 0), None);
        assert_eq!(zones(&list, &pool), vec![(0, 100, false)]);
    }

    #[test]
    fn split_fails_cleanly_when_pool_exhausted() {
        let mut pool = ZonePool::with_capacity(2);
        let mut list = ZoneList::new();
        list.reset(&mut pool, 0, 100);
        assert_eq!(list.split_for_jump(&mut pool, 50, 10, 0), None);
        assert_eq!(zones(&list, &pool), vec![(0, 100, false)]);
    }
}
