//! Fixed-capacity slot arena with index-linked chains.
//!
//! The pool owns every slot; a [`Chain`] is only a traversal order over a
//! subset of live slots. Several chains may share one pool (each dispatch
//! keeps its own stream-zone chain over the shared zone pool).

use alloc::vec::Vec;

struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Head/tail of a doubly linked list threaded through a [`Pool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Chain {
    pub const fn new() -> Self {
        Self { head: None, tail: None, len: 0 }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Arena of `capacity` slots plus a free list. Never grows.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot { value: None, prev: None, next: None })
                .collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(|s| s.value.as_mut())
    }

    /// Slot following `index` in its chain.
    pub fn next(&self, index: usize) -> Option<usize> {
        self.slots.get(index).and_then(|s| s.next)
    }

    pub fn prev(&self, index: usize) -> Option<usize> {
        self.slots.get(index).and_then(|s| s.prev)
    }

    fn take_free(&mut self, value: T) -> Result<usize, T> {
        match self.free.pop() {
            Some(index) => {
                self.slots[index].value = Some(value);
                Ok(index)
            }
            None => Err(value),
        }
    }

    /// Append to the end of `chain`. Hands the value back when the pool is full.
    pub fn push_back(&mut self, chain: &mut Chain, value: T) -> Result<usize, T> {
        let index = self.take_free(value)?;
        self.slots[index].prev = chain.tail;
        self.slots[index].next = None;
        match chain.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => chain.head = Some(index),
        }
        chain.tail = Some(index);
        chain.len += 1;
        Ok(index)
    }

    /// Insert directly after `after`, which must be linked into `chain`.
    pub fn insert_after(&mut self, chain: &mut Chain, after: usize, value: T) -> Result<usize, T> {
        let index = self.take_free(value)?;
        let next = self.slots[after].next;
        self.slots[index].prev = Some(after);
        self.slots[index].next = next;
        self.slots[after].next = Some(index);
        match next {
            Some(n) => self.slots[n].prev = Some(index),
            None => chain.tail = Some(index),
        }
        chain.len += 1;
        Ok(index)
    }

    /// Unlink `index` from `chain` and free its slot.
    pub fn remove(&mut self, chain: &mut Chain, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.value.take()?;
        let prev = self.slots[index].prev.take();
        let next = self.slots[index].next.take();
        match prev {
            Some(p) => self.slots[p].next = next,
            None => chain.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => chain.tail = prev,
        }
        chain.len -= 1;
        self.free.push(index);
        Some(value)
    }

    /// Free every slot linked into `chain`.
    pub fn clear_chain(&mut self, chain: &mut Chain) {
        while let Some(head) = chain.head {
            self.remove(chain, head);
        }
    }

    /// Iterate `(index, value)` over `chain` from head to tail.
    pub fn iter<'a>(&'a self, chain: &Chain) -> ChainIter<'a, T> {
        ChainIter { pool: self, cursor: chain.head }
    }
}

pub struct ChainIter<'a, T> {
    pool: &'a Pool<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for ChainIter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.pool.slots[index];
        self.cursor = slot.next;
        slot.value.as_ref().map(|v| (index, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pool: &Pool<u32>, chain: &Chain) -> Vec<u32> {
        pool.iter(chain).map(|(_, v)| *v).collect()
    }

    #[test]
    fn push_and_iterate_in_order() {
        let mut pool = Pool::with_capacity(4);
        let mut chain = Chain::new();
        for v in [1, 2, 3] {
            pool.push_back(&mut chain, v).unwrap();
        }
        assert_eq!(values(&pool, &chain), vec![1, 2, 3]);
        assert_eq!(chain.len(), 3);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn exhaustion_returns_value() {
        let mut pool = Pool::with_capacity(1);
        let mut chain = Chain::new();
        pool.push_back(&mut chain, 1).unwrap();
        assert_eq!(pool.push_back(&mut chain, 2), Err(2));
    }

    #[test]
    fn remove_relinks_neighbours() {
        let mut pool = Pool::with_capacity(4);
        let mut chain = Chain::new();
        let a = pool.push_back(&mut chain, 1).unwrap();
        let b = pool.push_back(&mut chain, 2).unwrap();
        let c = pool.push_back(&mut chain, 3).unwrap();

        assert_eq!(pool.remove(&mut chain, b), Some(2));
        assert_eq!(values(&pool, &chain), vec![1, 3]);
        assert_eq!(pool.next(a), Some(c));
        assert_eq!(pool.prev(c), Some(a));

        pool.remove(&mut chain, a);
        pool.remove(&mut chain, c);
        assert!(chain.is_empty());
        assert_eq!(chain.head(), None);
        assert_eq!(chain.tail(), None);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn insert_after_tail_moves_tail() {
        let mut pool = Pool::with_capacity(4);
        let mut chain = Chain::new();
        let a = pool.push_back(&mut chain, 1).unwrap();
        let c = pool.insert_after(&mut chain, a, 3).unwrap();
        pool.insert_after(&mut chain, a, 2).unwrap();
        assert_eq!(values(&pool, &chain), vec![1, 2, 3]);
        assert_eq!(chain.tail(), Some(c));
    }

    #[test]
    fn chains_share_one_pool() {
        let mut pool = Pool::with_capacity(4);
        let mut x = Chain::new();
        let mut y = Chain::new();
        pool.push_back(&mut x, 1).unwrap();
        pool.push_back(&mut y, 10).unwrap();
        pool.push_back(&mut x, 2).unwrap();
        assert_eq!(values(&pool, &x), vec![1, 2]);
        assert_eq!(values(&pool, &y), vec![10]);

        pool.clear_chain(&mut x);
        assert_eq!(values(&pool, &y), vec![10]);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut pool = Pool::with_capacity(2);
        let mut chain = Chain::new();
        let a = pool.push_back(&mut chain, 1).unwrap();
        assert!(pool.remove(&mut chain, a).is_some());
        assert!(pool.remove(&mut chain, a).is_none());
        assert_eq!(pool.free_count(), 2);
    }
}
