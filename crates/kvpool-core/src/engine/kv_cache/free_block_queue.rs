//! Evictable-block queue.
//!
//! A doubly linked list threaded through per-block link slots, so that a
//! cached block can be pulled out of the middle of the queue in O(1) when a
//! prefix hit pins it again. Only unreferenced blocks that still carry a
//! content hash live here.
//!
//! Eviction order:
//! - head = released longest ago, handed out first
//! - tail = most recently released

use crate::engine::types::BlockId;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
    queued: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            queued: false,
        }
    }
}

#[derive(Debug)]
pub struct FreeKVCacheBlockQueue {
    links: Vec<Link>,
    head: usize,
    tail: usize,
    num_free_blocks: usize,
}

impl FreeKVCacheBlockQueue {
    /// Create an empty queue able to hold block ids `0..num_blocks`.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            links: vec![Link::default(); num_blocks],
            head: NIL,
            tail: NIL,
            num_free_blocks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_free_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.num_free_blocks == 0
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.links.get(block_id).is_some_and(|l| l.queued)
    }

    /// Pop the block that has been free the longest.
    pub fn popleft(&mut self) -> Option<BlockId> {
        if self.head == NIL {
            return None;
        }
        let block_id = self.head;
        self.unlink(block_id);
        Some(block_id)
    }

    /// Unlink a block from anywhere in the queue.
    ///
    /// # Panics
    /// Panics if the block is not queued.
    pub fn remove(&mut self, block_id: BlockId) {
        assert!(self.contains(block_id), "block {} is not in the free queue", block_id);
        self.unlink(block_id);
    }

    /// Push a block to the tail.
    ///
    /// # Panics
    /// Panics if the block is already queued.
    pub fn append(&mut self, block_id: BlockId) {
        assert!(
            !self.links[block_id].queued,
            "block {} is already in the free queue",
            block_id
        );

        self.links[block_id] = Link {
            prev: self.tail,
            next: NIL,
            queued: true,
        };
        if self.tail == NIL {
            self.head = block_id;
        } else {
            self.links[self.tail].next = block_id;
        }
        self.tail = block_id;
        self.num_free_blocks += 1;
    }

    /// Queued blocks from head to tail.
    pub fn get_all_free_blocks(&self) -> Vec<BlockId> {
        let mut blocks = Vec::with_capacity(self.num_free_blocks);
        let mut current = self.head;
        while current != NIL {
            blocks.push(current);
            current = self.links[current].next;
        }
        blocks
    }

    fn unlink(&mut self, block_id: BlockId) {
        let Link { prev, next, .. } = self.links[block_id];

        if prev == NIL {
            self.head = next;
        } else {
            self.links[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.links[next].prev = prev;
        }

        self.links[block_id] = Link::default();
        self.num_free_blocks -= 1;
    }
}
