//! KV Cache Manager with prefix caching.
//!
//! Implements block management for paged attention following vLLM's v1
//! design:
//! - Fixed pool of blocks with per-block reference counts
//! - Content-addressed prefix cache over chained block hashes
//! - Lazy LRU eviction of unreferenced cached blocks
//! - Request-to-block mapping with preallocation
//!
//! All operations are synchronous bookkeeping for one engine instance. The
//! caller serializes access; there is no internal locking.

mod block_hash;
mod block_pool;
mod free_block_queue;
mod specialized_manager;
mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub use block_hash::{
    generate_block_hash_extra_keys, hash_request_tokens, BlockHash, ExtraHashKey, NONE_HASH,
};
pub use block_pool::{BlockPool, KVCacheBlock};
pub use free_block_queue::FreeKVCacheBlockQueue;
pub use specialized_manager::{
    get_specialized_manager, FullAttentionManager, SlidingWindowManager, SpecializedManager,
};
pub use stats::{CacheTelemetry, PrefixCacheStats, RecordingTelemetry, TelemetrySnapshot};

use super::request::{Request, RequestStatus};
use super::types::{BlockId, RequestId};
use crate::config::{CacheConfig, HashAlgo};
use crate::error::{Error, Result};

/// Per-request cache state owned by the manager.
#[derive(Debug, Default)]
struct RequestState {
    /// Blocks in sequence order
    blocks: Vec<BlockId>,
    /// Hash chain, computed once and extended as blocks fill up
    block_hashes: Option<Vec<BlockHash>>,
    /// Leading blocks already published to the prefix cache
    num_cached_blocks: Option<usize>,
}

impl RequestState {
    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.block_hashes.is_none() && self.num_cached_blocks.is_none()
    }
}

/// KV Cache Manager - tracks the blocks of every live request.
pub struct KVCacheManager {
    config: CacheConfig,
    block_size: usize,
    max_num_blocks_per_req: usize,
    num_preallocate_blocks: usize,
    enable_caching: bool,
    hash_algo: HashAlgo,
    block_pool: BlockPool,
    specialized_manager: Box<dyn SpecializedManager>,
    requests: HashMap<RequestId, RequestState>,
    prefix_cache_stats: PrefixCacheStats,
    telemetry: Option<Arc<dyn CacheTelemetry>>,
}

impl KVCacheManager {
    /// Create a new KV cache manager.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let mut block_pool = BlockPool::new(config.num_gpu_blocks, config.enable_prefix_caching);
        let specialized_manager = get_specialized_manager(&config.kv_cache_spec(), &mut block_pool);

        Ok(Self {
            block_size: config.block_size,
            max_num_blocks_per_req: config.max_num_blocks_per_req(),
            num_preallocate_blocks: config.num_preallocate_blocks(),
            enable_caching: config.enable_prefix_caching,
            hash_algo: config.prefix_caching_hash_algo,
            block_pool,
            specialized_manager,
            requests: HashMap::new(),
            prefix_cache_stats: PrefixCacheStats::default(),
            telemetry: None,
            config,
        })
    }

    /// Attach a sink for block-level hit/miss/eviction events.
    ///
    /// Events are only pushed when `log_stats` is enabled.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn CacheTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_pool(&self) -> &BlockPool {
        &self.block_pool
    }

    /// Fraction of the pool currently referenced, in `[0, 1]`.
    pub fn usage(&self) -> f64 {
        self.block_pool.get_usage()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.get_num_free_blocks()
    }

    pub fn block_ref_count(&self, block_id: BlockId) -> usize {
        self.block_pool.ref_count(block_id)
    }

    /// Blocks currently assigned to a request.
    pub fn req_blocks(&self, request_id: &str) -> &[BlockId] {
        self.requests
            .get(request_id)
            .map(|s| s.blocks.as_slice())
            .unwrap_or(&[])
    }

    /// Leading blocks of a request already published to the prefix cache.
    pub fn num_cached_blocks(&self, request_id: &str) -> Option<usize> {
        self.requests.get(request_id).and_then(|s| s.num_cached_blocks)
    }

    /// Requests holding blocks or a cached hash chain.
    pub fn num_tracked_requests(&self) -> usize {
        self.requests.len()
    }

    /// Drain the prefix cache counters accumulated since the last call.
    pub fn make_prefix_cache_stats(&mut self) -> PrefixCacheStats {
        std::mem::take(&mut self.prefix_cache_stats)
    }

    /// Find the already computed prefix of a request.
    ///
    /// Returns the resident blocks and the number of tokens they cover, which
    /// is always a multiple of the block size. The blocks are not pinned until
    /// they are passed to `allocate_slots`.
    pub fn get_computed_blocks(&mut self, request: &Request) -> (Vec<BlockId>, usize) {
        if !self.enable_caching || request.sampling_params.prompt_logprobs.is_some() {
            // Prompt logprobs need a real forward pass over every prompt token.
            return (Vec::new(), 0);
        }

        let (hash_algo, block_size) = (self.hash_algo, self.block_size);
        let state = self.requests.entry(request.request_id.clone()).or_default();
        let block_hashes = state
            .block_hashes
            .get_or_insert_with(|| hash_request_tokens(hash_algo, block_size, request));

        // When every token is covered by a full block, the last block is
        // recomputed so the first output token has logits to sample from.
        let mut num_query_blocks = block_hashes.len();
        if num_query_blocks > 0 && num_query_blocks * block_size == request.num_tokens() {
            num_query_blocks -= 1;
        }

        let computed_blocks = self
            .specialized_manager
            .find_longest_cache_hit(&self.block_pool, &block_hashes[..num_query_blocks]);

        let num_hits = computed_blocks.len();
        self.prefix_cache_stats.requests += 1;
        self.prefix_cache_stats.queries += num_query_blocks as u64;
        self.prefix_cache_stats.hits += num_hits as u64;
        if num_hits > 0 {
            self.prefix_cache_stats.request_hits += 1;
        }
        if self.config.log_stats {
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_hit(num_hits, &request.request_id);
                telemetry.record_miss(num_query_blocks - num_hits, &request.request_id);
            }
        }

        let num_computed_tokens = num_hits * block_size;
        (computed_blocks, num_computed_tokens)
    }

    /// Grow a request's block list to hold `num_new_tokens` more tokens.
    ///
    /// `new_computed_blocks` are prefix cache hits from `get_computed_blocks`
    /// that the request accepts. Blocks layout:
    ///
    /// ```text
    /// | < computed > | < new computed > |    < new >    | < preallocated > |
    /// |                  < required >                   |
    /// ```
    ///
    /// Returns the blocks newly taken from the pool, `Ok(None)` when the pool
    /// cannot satisfy the request right now, or an error for a zero token
    /// count or a request longer than `max_model_len`.
    pub fn allocate_slots(
        &mut self,
        request: &Request,
        num_new_tokens: usize,
        new_computed_blocks: &[BlockId],
    ) -> Result<Option<Vec<BlockId>>> {
        if num_new_tokens == 0 {
            return Err(Error::InvalidArgument(
                "num_new_tokens must be greater than 0".to_string(),
            ));
        }

        let block_size = self.block_size;
        // Computed tokens plus the new prefix cache hits.
        let num_computed_tokens = request.num_computed_tokens + new_computed_blocks.len() * block_size;
        let num_required_blocks = (num_computed_tokens + num_new_tokens).div_ceil(block_size);
        if num_required_blocks > self.max_num_blocks_per_req {
            return Err(Error::InvalidArgument(format!(
                "request {} needs {} blocks, more than the {} allowed by max_model_len",
                request.request_id, num_required_blocks, self.max_num_blocks_per_req
            )));
        }

        let state = self.requests.entry(request.request_id.clone()).or_default();

        // Blocks outside the attended context can go back even if this
        // allocation fails; doing it first also reduces evictions below.
        let removed_blocks = self
            .specialized_manager
            .remove_skipped_blocks(&mut state.blocks, request.num_computed_tokens);
        self.block_pool.free_blocks(removed_blocks);

        let num_new_blocks =
            num_required_blocks as isize - state.blocks.len() as isize - new_computed_blocks.len() as isize;

        // Hits still sitting in the evictable queue stop being free once pinned.
        let num_evictable_computed_blocks = new_computed_blocks
            .iter()
            .filter(|&&block_id| self.block_pool.ref_count(block_id) == 0)
            .count();
        let num_free_blocks = self.block_pool.get_num_free_blocks();
        if num_new_blocks > num_free_blocks as isize - num_evictable_computed_blocks as isize {
            debug!(
                "Cannot allocate {} blocks for request {} ({} free, {} evictable hits)",
                num_new_blocks, request.request_id, num_free_blocks, num_evictable_computed_blocks
            );
            if state.is_empty() {
                self.requests.remove(&request.request_id);
            }
            return Ok(None);
        }

        if self.enable_caching {
            self.block_pool.touch(new_computed_blocks);
        } else {
            assert!(
                new_computed_blocks.is_empty(),
                "computed blocks must be empty when prefix caching is disabled"
            );
        }
        state.blocks.extend_from_slice(new_computed_blocks);

        let new_blocks = if num_new_blocks <= 0 {
            Vec::new()
        } else {
            let num_blocks = (num_new_blocks as usize + self.num_preallocate_blocks)
                .min(self.block_pool.get_num_free_blocks())
                .min(self.max_num_blocks_per_req - state.blocks.len());
            assert!(num_blocks > 0);

            let evictions_before = self.block_pool.num_evictions();
            let new_blocks = self.block_pool.get_new_blocks(num_blocks);
            let num_evicted = (self.block_pool.num_evictions() - evictions_before) as usize;
            if num_evicted > 0 {
                self.prefix_cache_stats.evictions += num_evicted as u64;
                self.prefix_cache_stats.request_evictions += 1;
                if self.config.log_stats {
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.record_eviction(num_evicted, &request.request_id);
                    }
                }
            }

            state.blocks.extend_from_slice(&new_blocks);
            new_blocks
        };

        debug!(
            "Allocated {} new blocks for request {} ({} total, {} hits)",
            new_blocks.len(),
            request.request_id,
            state.blocks.len(),
            new_computed_blocks.len()
        );

        if !self.enable_caching {
            return Ok(Some(new_blocks));
        }

        // A new request starts from its hits; a running one from its record.
        let num_cached_blocks = state.num_cached_blocks.unwrap_or(new_computed_blocks.len());
        // Speculative tokens may still be rejected, so blocks holding them
        // are not published.
        let num_full_blocks_after_append = (num_computed_tokens + num_new_tokens)
            .saturating_sub(request.spec_token_ids.len())
            / block_size;

        let hash_algo = self.hash_algo;
        let RequestState {
            blocks,
            block_hashes,
            num_cached_blocks: recorded,
        } = state;
        let block_hashes =
            block_hashes.get_or_insert_with(|| hash_request_tokens(hash_algo, block_size, request));
        self.block_pool.cache_full_blocks(
            request,
            blocks,
            block_hashes,
            num_cached_blocks,
            num_full_blocks_after_append,
            block_size,
            hash_algo,
        );
        *recorded = Some(num_full_blocks_after_append.max(num_cached_blocks));

        Ok(Some(new_blocks))
    }

    /// Release every block of a request.
    ///
    /// With caching enabled the blocks are released tail first: the tail is
    /// the most request-specific content, so it becomes evictable before the
    /// shared prefix. Unknown requests are ignored. The hash chain is kept
    /// for a possible reschedule.
    pub fn free(&mut self, request: &Request) {
        let Some(state) = self.requests.get_mut(&request.request_id) else {
            return;
        };
        let blocks = std::mem::take(&mut state.blocks);
        state.num_cached_blocks = None;
        if state.is_empty() {
            self.requests.remove(&request.request_id);
        }

        debug!("Freeing {} blocks for request {}", blocks.len(), request.request_id);
        if self.enable_caching {
            self.block_pool.free_blocks(blocks.into_iter().rev());
        } else {
            self.block_pool.free_blocks(blocks);
        }
    }

    /// Invalidate the whole prefix cache, e.g. after a weight update.
    ///
    /// Returns `false` without changing anything while any request still
    /// holds blocks.
    pub fn reset_prefix_cache(&mut self) -> bool {
        if self.block_pool.reset_prefix_cache() {
            self.prefix_cache_stats.reset = true;
            return true;
        }
        false
    }

    /// Number of leading blocks shared by every running request.
    ///
    /// `request` may be any running request. A block is common when its ref
    /// count equals `num_running_requests`; the scan stops at the first block
    /// that is not. Running requests that are not scheduled this step still
    /// count, so this can report 0 even when all scheduled requests share a
    /// prefix.
    ///
    /// # Panics
    /// Panics if `request` is not running.
    pub fn get_num_common_prefix_blocks(&self, request: &Request, num_running_requests: usize) -> usize {
        assert_eq!(
            request.status,
            RequestStatus::Running,
            "common prefix requires a running request"
        );
        self.req_blocks(&request.request_id)
            .iter()
            .take_while(|&&block_id| self.block_pool.ref_count(block_id) == num_running_requests)
            .count()
    }

    /// Discard a finished request's hash chain.
    ///
    /// A preempted request keeps its chain so rescheduling does not rehash the
    /// prompt; calls for unfinished requests are ignored.
    pub fn free_block_hashes(&mut self, request: &Request) {
        if !request.is_finished() {
            warn!(
                "Keeping block hashes of request {} in state {:?}",
                request.request_id,
                request.status
            );
            return;
        }
        if let Some(state) = self.requests.get_mut(&request.request_id) {
            state.block_hashes = None;
            if state.is_empty() {
                self.requests.remove(&request.request_id);
            }
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> KVCacheStats {
        let total_blocks = self.block_pool.num_gpu_blocks();
        let free_blocks = self.block_pool.get_num_free_blocks();
        KVCacheStats {
            total_blocks,
            used_blocks: self.block_pool.get_num_used_blocks(),
            free_blocks,
            cached_blocks: self.block_pool.num_cached_blocks(),
            num_requests: self.requests.values().filter(|s| !s.blocks.is_empty()).count(),
        }
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheStats {
    pub total_blocks: usize,
    /// Blocks referenced by requests; a reserved null block is not counted
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Blocks indexed in the prefix cache, referenced or not
    pub cached_blocks: usize,
    /// Requests currently holding blocks
    pub num_requests: usize,
}

impl KVCacheStats {
    /// Block utilization as a fraction.
    pub fn utilization(&self) -> f32 {
        if self.total_blocks > 0 {
            self.used_blocks as f32 / self.total_blocks as f32
        } else {
            0.0
        }
    }
}
