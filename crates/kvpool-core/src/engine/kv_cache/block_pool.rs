//! Physical block inventory with a content-addressed prefix cache.
//!
//! Blocks live in a flat `Vec` indexed by `BlockId`. An unreferenced block
//! sits in one of two places:
//! - the empty list, if it carries no content hash;
//! - the evictable queue, if it is still indexed in the prefix cache.
//!
//! Cached blocks keep their hash after release so a later request with the
//! same prefix can pick them up again. The hash is only dropped when the
//! block is handed out for new content.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::block_hash::{generate_block_hash_extra_keys, BlockHash};
use super::free_block_queue::FreeKVCacheBlockQueue;
use crate::config::HashAlgo;
use crate::engine::request::Request;
use crate::engine::types::BlockId;

/// Bookkeeping for one physical block.
#[derive(Debug, Clone)]
pub struct KVCacheBlock {
    pub block_id: BlockId,
    /// Number of requests currently using this block
    pub ref_cnt: usize,
    /// Set once the block is full and published to the prefix cache
    pub block_hash: Option<BlockHash>,
}

impl KVCacheBlock {
    fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_cnt: 0,
            block_hash: None,
        }
    }
}

pub struct BlockPool {
    blocks: Vec<KVCacheBlock>,
    /// Unreferenced blocks without content, handed out first
    empty_blocks: VecDeque<BlockId>,
    /// Unreferenced cached blocks, least recently released at the head
    free_block_queue: FreeKVCacheBlockQueue,
    cached_block_hash_to_block: HashMap<BlockHash, BlockId>,
    enable_caching: bool,
    /// Placeholder for positions a sliding window no longer attends to
    null_block: Option<BlockId>,
    num_evictions: u64,
}

impl BlockPool {
    pub fn new(num_gpu_blocks: usize, enable_caching: bool) -> Self {
        Self {
            blocks: (0..num_gpu_blocks).map(KVCacheBlock::new).collect(),
            empty_blocks: (0..num_gpu_blocks).collect(),
            free_block_queue: FreeKVCacheBlockQueue::new(num_gpu_blocks),
            cached_block_hash_to_block: HashMap::new(),
            enable_caching,
            null_block: None,
            num_evictions: 0,
        }
    }

    pub fn num_gpu_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The reserved null block, taken out of the pool on first use.
    ///
    /// The null block is permanently referenced: it is never freed, cached or
    /// evicted.
    pub fn null_block(&mut self) -> BlockId {
        if let Some(block_id) = self.null_block {
            return block_id;
        }
        let block_id = self
            .empty_blocks
            .pop_front()
            .or_else(|| self.free_block_queue.popleft())
            .expect("null block must be reserved before the pool is exhausted");
        self.maybe_evict_cached_block(block_id);
        self.blocks[block_id].ref_cnt = 1;
        self.null_block = Some(block_id);
        block_id
    }

    pub fn is_null(&self, block_id: BlockId) -> bool {
        self.null_block == Some(block_id)
    }

    pub fn get_block(&self, block_id: BlockId) -> &KVCacheBlock {
        &self.blocks[block_id]
    }

    pub fn ref_count(&self, block_id: BlockId) -> usize {
        self.blocks[block_id].ref_cnt
    }

    /// Resident block holding the given content, if any.
    pub fn get_cached_block(&self, block_hash: &BlockHash) -> Option<BlockId> {
        self.cached_block_hash_to_block.get(block_hash).copied()
    }

    /// Number of entries in the prefix cache index.
    pub fn num_cached_blocks(&self) -> usize {
        self.cached_block_hash_to_block.len()
    }

    /// Blocks with no references, empty or evictable.
    pub fn get_num_free_blocks(&self) -> usize {
        self.empty_blocks.len() + self.free_block_queue.len()
    }

    /// Fraction of blocks currently referenced.
    pub fn get_usage(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        1.0 - self.get_num_free_blocks() as f64 / self.blocks.len() as f64
    }

    /// Cached blocks whose identity was dropped to make room, since creation.
    pub fn num_evictions(&self) -> u64 {
        self.num_evictions
    }

    /// Pin cached blocks for a request that is about to reuse them.
    pub fn touch(&mut self, blocks: &[BlockId]) {
        for &block_id in blocks {
            if self.is_null(block_id) {
                continue;
            }
            if self.blocks[block_id].ref_cnt == 0 {
                self.free_block_queue.remove(block_id);
            }
            self.blocks[block_id].ref_cnt += 1;
        }
    }

    /// Take `num_blocks` blocks with a ref count of one each.
    ///
    /// Empty blocks are used first; cached blocks are then evicted from the
    /// head of the evictable queue.
    ///
    /// # Panics
    /// Panics if fewer than `num_blocks` blocks are free. Callers check
    /// capacity beforehand.
    pub fn get_new_blocks(&mut self, num_blocks: usize) -> Vec<BlockId> {
        assert!(
            num_blocks <= self.get_num_free_blocks(),
            "Cannot get {} free blocks from the pool ({} free)",
            num_blocks,
            self.get_num_free_blocks()
        );

        let mut ret = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let block_id = match self.empty_blocks.pop_front() {
                Some(block_id) => block_id,
                None => {
                    let block_id = self
                        .free_block_queue
                        .popleft()
                        .expect("free block count checked above");
                    self.maybe_evict_cached_block(block_id);
                    block_id
                }
            };
            let block = &mut self.blocks[block_id];
            assert_eq!(block.ref_cnt, 0, "block {} handed out while in use", block_id);
            block.ref_cnt = 1;
            ret.push(block_id);
        }
        ret
    }

    /// Drop a block's content identity and its index entry.
    fn maybe_evict_cached_block(&mut self, block_id: BlockId) -> bool {
        let Some(block_hash) = self.blocks[block_id].block_hash.take() else {
            return false;
        };
        if self.cached_block_hash_to_block.get(&block_hash) == Some(&block_id) {
            self.cached_block_hash_to_block.remove(&block_hash);
        }
        self.num_evictions += 1;
        true
    }

    /// Release one reference on each block, in the given order.
    ///
    /// Blocks reaching zero references are queued behind every block released
    /// earlier, so the order here decides eviction order later.
    ///
    /// # Panics
    /// Panics if a block is released more often than it was taken.
    pub fn free_blocks<I>(&mut self, ordered_blocks: I)
    where
        I: IntoIterator<Item = BlockId>,
    {
        for block_id in ordered_blocks {
            if self.is_null(block_id) {
                continue;
            }
            let block = &mut self.blocks[block_id];
            assert!(
                block.ref_cnt > 0,
                "block {} released with a zero ref count",
                block_id
            );
            block.ref_cnt -= 1;
            if block.ref_cnt == 0 {
                if block.block_hash.is_some() {
                    self.free_block_queue.append(block_id);
                } else {
                    self.empty_blocks.push_back(block_id);
                }
            }
        }
    }

    /// Publish the request's newly completed blocks to the prefix cache.
    ///
    /// Blocks `[num_cached_blocks, num_full_blocks)` of `blocks` are given the
    /// matching hash from `block_hashes`. Hashes missing from the chain (blocks
    /// completed by generated tokens) are computed from the request's tokens
    /// and appended to `block_hashes`. A block whose content is already
    /// resident elsewhere is left unindexed.
    #[allow(clippy::too_many_arguments)]
    pub fn cache_full_blocks(
        &mut self,
        request: &Request,
        blocks: &[BlockId],
        block_hashes: &mut Vec<BlockHash>,
        num_cached_blocks: usize,
        num_full_blocks: usize,
        block_size: usize,
        hash_algo: HashAlgo,
    ) {
        if !self.enable_caching || num_cached_blocks >= num_full_blocks {
            return;
        }
        assert!(
            block_hashes.len() >= num_cached_blocks,
            "hash chain of request {} is shorter than its cached blocks",
            request.request_id
        );
        assert!(num_full_blocks <= blocks.len());

        let mut prev_hash_value = num_cached_blocks
            .checked_sub(1)
            .map(|i| block_hashes[i].hash_value);

        for blk_idx in num_cached_blocks..num_full_blocks {
            let block_hash = match block_hashes.get(blk_idx) {
                Some(block_hash) => block_hash.clone(),
                None => {
                    let start = blk_idx * block_size;
                    let end = start + block_size;
                    let block_tokens = request.token_range(start, end);
                    assert_eq!(
                        block_tokens.len(),
                        block_size,
                        "block {} of request {} is not full",
                        blk_idx,
                        request.request_id
                    );
                    let extra_keys = generate_block_hash_extra_keys(request, start, end);
                    let block_hash =
                        hash_algo.hash_block_tokens(prev_hash_value, &block_tokens, extra_keys);
                    block_hashes.push(block_hash.clone());
                    block_hash
                }
            };
            prev_hash_value = Some(block_hash.hash_value);

            let block_id = blocks[blk_idx];
            if self.is_null(block_id) {
                continue;
            }
            assert!(
                self.blocks[block_id].block_hash.is_none(),
                "block {} is already cached",
                block_id
            );
            if self.cached_block_hash_to_block.contains_key(&block_hash) {
                continue;
            }
            self.blocks[block_id].block_hash = Some(block_hash.clone());
            self.cached_block_hash_to_block.insert(block_hash, block_id);
        }
    }

    /// Blocks referenced by requests. The null block is not counted.
    pub fn get_num_used_blocks(&self) -> usize {
        let num_reserved = usize::from(self.null_block.is_some());
        self.blocks.len() - self.get_num_free_blocks() - num_reserved
    }

    /// Forget every cached block. Refused while any block is referenced.
    pub fn reset_prefix_cache(&mut self) -> bool {
        let num_used_blocks = self.get_num_used_blocks();
        if num_used_blocks > 0 {
            warn!(
                "Failed to reset prefix cache because some blocks ({}) are not freed yet",
                num_used_blocks
            );
            return false;
        }

        self.cached_block_hash_to_block.clear();
        while let Some(block_id) = self.free_block_queue.popleft() {
            self.blocks[block_id].block_hash = None;
            self.empty_blocks.push_back(block_id);
        }
        debug!("Prefix cache cleared, {} blocks empty", self.empty_blocks.len());
        info!("Successfully reset prefix cache");
        true
    }
}
