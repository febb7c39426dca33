//! Attention-topology policies.
//!
//! A policy answers two questions for the cache manager: which prefix of a
//! hash chain is already resident, and which of a request's blocks the
//! attention pattern no longer reads.

use super::block_hash::BlockHash;
use super::block_pool::BlockPool;
use crate::config::{AttentionType, KVCacheSpec};
use crate::engine::types::BlockId;

pub trait SpecializedManager: Send {
    /// Longest run of resident blocks usable as computed prefix.
    ///
    /// The returned blocks are not pinned; the caller pins them when it
    /// accepts the hit.
    fn find_longest_cache_hit(&self, block_pool: &BlockPool, block_hashes: &[BlockHash]) -> Vec<BlockId>;

    /// Replace blocks that fall outside the attended context and return them
    /// for release.
    fn remove_skipped_blocks(&self, blocks: &mut [BlockId], num_computed_tokens: usize) -> Vec<BlockId>;
}

/// Pick the policy for a cache spec. The sliding window policy reserves the
/// pool's null block.
pub fn get_specialized_manager(
    kv_cache_spec: &KVCacheSpec,
    block_pool: &mut BlockPool,
) -> Box<dyn SpecializedManager> {
    match kv_cache_spec.attention {
        AttentionType::Full => Box::new(FullAttentionManager),
        AttentionType::SlidingWindow { window } => Box::new(SlidingWindowManager::new(
            kv_cache_spec.block_size,
            window,
            block_pool.null_block(),
        )),
    }
}

/// Every block stays relevant for the whole request.
pub struct FullAttentionManager;

impl SpecializedManager for FullAttentionManager {
    fn find_longest_cache_hit(&self, block_pool: &BlockPool, block_hashes: &[BlockHash]) -> Vec<BlockId> {
        // A later match is meaningless once an earlier block missed.
        block_hashes
            .iter()
            .map_while(|block_hash| block_pool.get_cached_block(block_hash))
            .collect()
    }

    fn remove_skipped_blocks(&self, _blocks: &mut [BlockId], _num_computed_tokens: usize) -> Vec<BlockId> {
        Vec::new()
    }
}

/// Only the last `sliding_window` tokens are attended to.
pub struct SlidingWindowManager {
    block_size: usize,
    sliding_window: usize,
    /// Contiguous resident blocks needed to cover one window
    sliding_window_contiguous_blocks: usize,
    null_block: BlockId,
}

impl SlidingWindowManager {
    pub fn new(block_size: usize, sliding_window: usize, null_block: BlockId) -> Self {
        // The token being computed is itself part of the window.
        let contiguous = (sliding_window.saturating_sub(1)).div_ceil(block_size).max(1);
        Self {
            block_size,
            sliding_window,
            sliding_window_contiguous_blocks: contiguous,
            null_block,
        }
    }
}

impl SpecializedManager for SlidingWindowManager {
    fn find_longest_cache_hit(&self, block_pool: &BlockPool, block_hashes: &[BlockHash]) -> Vec<BlockId> {
        let mut computed_blocks = vec![self.null_block; block_hashes.len()];
        let mut num_contiguous_blocks = 0;

        // Search from the right and stop at the first window-sized run.
        for i in (0..block_hashes.len()).rev() {
            match block_pool.get_cached_block(&block_hashes[i]) {
                Some(block_id) => {
                    computed_blocks[i] = block_id;
                    num_contiguous_blocks += 1;
                    if num_contiguous_blocks >= self.sliding_window_contiguous_blocks {
                        // [NULL, NULL, 8, 3, NULL, 9] -> [NULL, NULL, 8, 3]
                        computed_blocks.truncate(i + num_contiguous_blocks);
                        return computed_blocks;
                    }
                }
                None => num_contiguous_blocks = 0,
            }
        }

        // A shorter run starting at block 0 is still a valid hit.
        computed_blocks.truncate(num_contiguous_blocks);
        computed_blocks
    }

    fn remove_skipped_blocks(&self, blocks: &mut [BlockId], num_computed_tokens: usize) -> Vec<BlockId> {
        let last_useful_token = (num_computed_tokens + 1).saturating_sub(self.sliding_window);
        let last_useful_block = (last_useful_token / self.block_size).min(blocks.len());

        let mut removed_blocks = Vec::new();
        for i in (0..last_useful_block).rev() {
            if blocks[i] == self.null_block {
                // Earlier blocks were nulled by a previous call.
                break;
            }
            removed_blocks.push(blocks[i]);
            blocks[i] = self.null_block;
        }
        removed_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashAlgo;
    use crate::engine::kv_cache::block_hash::hash_request_tokens;
    use crate::engine::request::Request;

    /// Pool in which only the chain positions listed in `cached` are resident.
    fn pool_with_cached(
        request: &Request,
        block_size: usize,
        cached: &[usize],
    ) -> (BlockPool, Vec<BlockId>, Vec<BlockHash>) {
        let mut pool = BlockPool::new(16, true);
        let mut hashes = hash_request_tokens(HashAlgo::Builtin, block_size, request);
        let blocks = pool.get_new_blocks(hashes.len());
        for &i in cached {
            pool.cache_full_blocks(request, &blocks, &mut hashes, i, i + 1, block_size, HashAlgo::Builtin);
        }
        (pool, blocks, hashes)
    }

    #[test]
    fn test_full_attention_stops_at_first_miss() {
        let request = Request::new("a", (0..16).collect());
        let (pool, blocks, hashes) = pool_with_cached(&request, 4, &[0, 1, 3]);
        assert!(pool.get_cached_block(&hashes[3]).is_some());

        let hit = FullAttentionManager.find_longest_cache_hit(&pool, &hashes);
        assert_eq!(hit, vec![blocks[0], blocks[1]]);

        let mut request_blocks = blocks.clone();
        assert!(FullAttentionManager
            .remove_skipped_blocks(&mut request_blocks, 16)
            .is_empty());
        assert_eq!(request_blocks, blocks);
    }

    #[test]
    fn test_sliding_window_hit_from_the_right() {
        // A 9-token window with 4-token blocks needs 2 contiguous blocks.
        let request = Request::new("a", (0..24).collect());
        let (pool, blocks, hashes) = pool_with_cached(&request, 4, &[1, 2, 3, 5]);
        let manager = SlidingWindowManager::new(4, 9, 15);
        assert_eq!(manager.sliding_window_contiguous_blocks, 2);

        let hit = manager.find_longest_cache_hit(&pool, &hashes);
        assert_eq!(hit, vec![15, blocks[1], blocks[2], blocks[3]]);
    }

    #[test]
    fn test_sliding_window_short_leading_run() {
        let request = Request::new("a", (0..16).collect());
        let (pool, blocks, hashes) = pool_with_cached(&request, 4, &[0, 3]);
        let manager = SlidingWindowManager::new(4, 9, 15);
        let hit = manager.find_longest_cache_hit(&pool, &hashes);
        assert_eq!(hit, vec![blocks[0]]);
    }

    #[test]
    fn test_sliding_window_removes_out_of_window_blocks() {
        let manager = SlidingWindowManager::new(4, 8, 99);
        let mut blocks = vec![1, 2, 3, 4, 5];

        // 16 computed tokens: tokens before 9 left the window, so blocks 0 and 1 go.
        let removed = manager.remove_skipped_blocks(&mut blocks, 16);
        assert_eq!(removed, vec![2, 1]);
        assert_eq!(blocks, vec![99, 99, 3, 4, 5]);

        // Later calls only release newly skipped blocks.
        let removed = manager.remove_skipped_blocks(&mut blocks, 20);
        assert_eq!(removed, vec![3]);
        assert_eq!(blocks, vec![99, 99, 99, 4, 5]);

        assert!(manager.remove_skipped_blocks(&mut blocks, 3).is_empty());
    }

    #[test]
    fn test_policy_selection_reserves_null_block() {
        let mut pool = BlockPool::new(4, true);
        let spec = KVCacheSpec {
            block_size: 4,
            attention: AttentionType::SlidingWindow { window: 8 },
            ..KVCacheSpec::default()
        };
        let _manager = get_specialized_manager(&spec, &mut pool);
        assert_eq!(pool.get_num_free_blocks(), 3);

        let mut pool = BlockPool::new(4, true);
        let _manager = get_specialized_manager(&KVCacheSpec::default(), &mut pool);
        assert_eq!(pool.get_num_free_blocks(), 4);
    }
}
