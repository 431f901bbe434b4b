//! Chained hash index from backing-device keys to cache lines.
//!
//! The metablock population is a dense, fixed array, so chains are realized
//! as prev/next slot arrays instead of pointer lists. A line is either on
//! exactly one bucket chain or parked on the sentinel null bucket, which
//! makes "detached" a first-class state.

use crate::segment::Metablock;
use wbc_types::{BLOCK_SECTORS_SHIFT, CacheSlot, Sector};

const NIL: u32 = u32::MAX;

#[derive(Debug)]
pub struct HashIndex {
    nbuckets: u32,
    heads: Vec<u32>,
    next: Vec<u32>,
    prev: Vec<u32>,
    /// Bucket each line is chained on; `nbuckets` is the null bucket.
    bucket: Vec<u32>,
}

impl HashIndex {
    #[must_use]
    pub fn new(nbuckets: u32, nr_caches: u32) -> Self {
        let n = nr_caches as usize;
        Self {
            nbuckets,
            heads: vec![NIL; nbuckets as usize],
            next: vec![NIL; n],
            prev: vec![NIL; n],
            bucket: vec![nbuckets; n],
        }
    }

    /// Deterministic bucket for a 4 KiB-aligned key.
    #[must_use]
    pub fn head_of(&self, key: Sector) -> u32 {
        ((key.0 >> BLOCK_SECTORS_SHIFT) % u64::from(self.nbuckets)) as u32
    }

    /// Find the line caching `key`, if any.
    #[must_use]
    pub fn lookup(&self, head: u32, key: Sector, mbs: &[Metablock]) -> Option<CacheSlot> {
        let mut cur = self.heads[head as usize];
        while cur != NIL {
            if mbs[cur as usize].key() == key {
                return Some(CacheSlot(cur));
            }
            cur = self.next[cur as usize];
        }
        None
    }

    /// Bind `idx` to `key` under `head`, detaching it from any prior bucket.
    ///
    /// A prior occupant of the same key must have been invalidated by the
    /// caller; registration itself never displaces other lines.
    pub fn register(&mut self, head: u32, idx: CacheSlot, key: Sector, mbs: &[Metablock]) {
        let i = idx.0 as usize;
        self.unlink(i);
        mbs[i].set_key(key);

        let old_head = self.heads[head as usize];
        self.next[i] = old_head;
        self.prev[i] = NIL;
        if old_head != NIL {
            self.prev[old_head as usize] = idx.0;
        }
        self.heads[head as usize] = idx.0;
        self.bucket[i] = head;
    }

    /// Detach `idx` to the null bucket. No-op when already detached.
    pub fn delete(&mut self, idx: CacheSlot) {
        self.unlink(idx.0 as usize);
    }

    #[must_use]
    pub fn is_registered(&self, idx: CacheSlot) -> bool {
        self.bucket[idx.0 as usize] != self.nbuckets
    }

    fn unlink(&mut self, i: usize) {
        let b = self.bucket[i];
        if b == self.nbuckets {
            return;
        }
        let (p, n) = (self.prev[i], self.next[i]);
        if p == NIL {
            self.heads[b as usize] = n;
        } else {
            self.next[p as usize] = n;
        }
        if n != NIL {
            self.prev[n as usize] = p;
        }
        self.prev[i] = NIL;
        self.next[i] = NIL;
        self.bucket[i] = self.nbuckets;
    }
}
