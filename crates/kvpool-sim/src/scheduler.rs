//! FCFS scheduler driving the cache manager the way a serving engine does.
//!
//! Each step:
//! - Running requests decode one token; when the pool is full the most
//!   recently admitted request is preempted and requeued
//! - Waiting requests are admitted in arrival order after a prefix lookup
//! - Finished requests release their blocks and hash chains

use std::collections::VecDeque;

use kvpool_core::{KVCacheManager, Request, RequestStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::workload::Workload;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of running requests
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum tokens per step (token budget)
    #[serde(default = "default_max_tokens_per_step")]
    pub max_tokens_per_step: usize,
    /// Preempt running requests when the KV cache is full
    #[serde(default = "default_enable_preemption")]
    pub enable_preemption: bool,
}

fn default_max_batch_size() -> usize {
    32
}

fn default_max_tokens_per_step() -> usize {
    2048
}

fn default_enable_preemption() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_tokens_per_step: default_max_tokens_per_step(),
            enable_preemption: default_enable_preemption(),
        }
    }
}

/// Work done in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepResult {
    pub num_decoded: usize,
    pub num_prefilled: usize,
    /// Prompt tokens served from the prefix cache
    pub num_cached_tokens: usize,
    /// Prompt tokens actually computed
    pub num_prefill_tokens: usize,
    pub num_preempted: usize,
    pub num_finished: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    waiting: VecDeque<Request>,
    /// Running requests in admission order
    running: Vec<Request>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            waiting: VecDeque::new(),
            running: Vec::new(),
        }
    }

    pub fn add_request(&mut self, request: Request) {
        debug!(
            "Added request {} to waiting queue (prompt_tokens={})",
            request.request_id,
            request.num_prompt_tokens()
        );
        self.waiting.push_back(request);
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn has_unfinished_requests(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// Schedule and "execute" one step. Generated tokens come from the
    /// workload's sampler.
    pub fn step(
        &mut self,
        kv_cache: &mut KVCacheManager,
        workload: &mut Workload,
    ) -> kvpool_core::Result<StepResult> {
        let mut result = StepResult::default();
        let mut remaining_budget = self.config.max_tokens_per_step;

        // Phase 1: decode. Running requests keep their blocks, so they go first.
        let mut scheduled = Vec::new();
        let mut i = 0;
        while i < self.running.len() && remaining_budget > 0 {
            if kv_cache.allocate_slots(&self.running[i], 1, &[])?.is_some() {
                scheduled.push(i);
                remaining_budget -= 1;
                i += 1;
                continue;
            }
            if !self.config.enable_preemption {
                warn!("KV cache full, request {} skips this step", self.running[i].request_id);
                i += 1;
                continue;
            }
            // Newest request goes first; it may be the one being scheduled.
            if let Some(victim) = self.running.pop() {
                self.preempt(kv_cache, victim);
                result.num_preempted += 1;
            }
        }

        for &idx in &scheduled {
            let request = &mut self.running[idx];
            request.num_computed_tokens += 1;
            request.append_output_token_ids(&[workload.sample()]);
            result.num_decoded += 1;
        }

        // Phase 2: admit waiting requests in arrival order.
        while self.running.len() < self.config.max_batch_size && remaining_budget > 0 {
            let Some(request) = self.waiting.front() else {
                break;
            };

            let (computed_blocks, num_computed_tokens) = kv_cache.get_computed_blocks(request);
            let num_new_tokens = request.num_tokens() - request.num_computed_tokens - num_computed_tokens;
            if num_new_tokens > remaining_budget && result.num_prefilled > 0 {
                break;
            }

            let Some(new_blocks) = kv_cache.allocate_slots(request, num_new_tokens, &computed_blocks)? else {
                debug!("KV cache full for prefill, request {} keeps waiting", request.request_id);
                break;
            };

            let Some(mut request) = self.waiting.pop_front() else {
                break;
            };
            debug!(
                "Scheduled request {} ({} cached tokens, {} new blocks)",
                request.request_id,
                num_computed_tokens,
                new_blocks.len()
            );
            request.num_computed_tokens = request.num_tokens();
            request.status = RequestStatus::Running;
            request.append_output_token_ids(&[workload.sample()]);

            remaining_budget = remaining_budget.saturating_sub(num_new_tokens);
            result.num_prefilled += 1;
            result.num_cached_tokens += num_computed_tokens;
            result.num_prefill_tokens += num_new_tokens;
            self.running.push(request);
        }

        result.num_finished = self.finish_requests(kv_cache);
        Ok(result)
    }

    fn preempt(&mut self, kv_cache: &mut KVCacheManager, mut request: Request) {
        debug!("Preempting request {}", request.request_id);
        kv_cache.free(&request);
        request.status = RequestStatus::Preempted;
        request.num_computed_tokens = 0;
        self.waiting.push_front(request);
    }

    fn finish_requests(&mut self, kv_cache: &mut KVCacheManager) -> usize {
        let max_model_len = kv_cache.config().max_model_len;
        let (finished, running): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.running).into_iter().partition(|r| {
                r.output_token_ids.len() >= r.sampling_params.max_tokens || r.num_tokens() >= max_model_len
            });
        self.running = running;

        let num_finished = finished.len();
        for mut request in finished {
            request.status = RequestStatus::Finished;
            kv_cache.free(&request);
            kv_cache.free_block_hashes(&request);
            debug!("Finished request {}", request.request_id);
        }
        num_finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadConfig;
    use kvpool_core::CacheConfig;

    fn setup(num_blocks: usize, num_requests: usize) -> (Scheduler, KVCacheManager, Workload) {
        let cache = KVCacheManager::new(CacheConfig {
            block_size: 4,
            num_gpu_blocks: num_blocks,
            max_model_len: 64,
            num_preallocate_tokens: 0,
            ..CacheConfig::default()
        })
        .unwrap();
        let workload = Workload::new(WorkloadConfig {
            num_requests,
            num_prefixes: 1,
            prefix_len: 8,
            suffix_len: 2,
            max_tokens: 4,
            arrivals_per_step: num_requests,
            seed: 7,
        });
        (Scheduler::new(SchedulerConfig::default()), cache, workload)
    }

    fn run(scheduler: &mut Scheduler, cache: &mut KVCacheManager, workload: &mut Workload) -> Vec<StepResult> {
        for request in workload.arrivals() {
            scheduler.add_request(request);
        }
        let mut steps = Vec::new();
        while scheduler.has_unfinished_requests() {
            steps.push(scheduler.step(cache, workload).unwrap());
            assert!(steps.len() < 100, "scheduler made no progress");
        }
        steps
    }

    #[test]
    fn test_shared_prefix_hits_cache() {
        let (mut scheduler, mut cache, mut workload) = setup(32, 3);
        let steps = run(&mut scheduler, &mut cache, &mut workload);

        let first = &steps[0];
        assert_eq!(first.num_prefilled, 3);
        // Requests 2 and 3 reuse the two prefix blocks.
        assert_eq!(first.num_cached_tokens, 16);

        let finished: usize = steps.iter().map(|s| s.num_finished).sum();
        assert_eq!(finished, 3);
        assert_eq!(cache.num_free_blocks(), 32);
        assert_eq!(cache.num_tracked_requests(), 0);
    }

    #[test]
    fn test_preemption_under_pressure() {
        // Both requests share two prefix blocks and own one more each. Growing
        // to a fourth block fits only one of them in a five block pool.
        let (mut scheduler, mut cache, mut workload) = setup(5, 2);
        let steps = run(&mut scheduler, &mut cache, &mut workload);

        let preempted: usize = steps.iter().map(|s| s.num_preempted).sum();
        assert!(preempted > 0);
        let finished: usize = steps.iter().map(|s| s.num_finished).sum();
        assert_eq!(finished, 2);
        assert_eq!(cache.num_free_blocks(), 5);
    }
}
