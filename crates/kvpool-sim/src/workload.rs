//! Synthetic request streams with shared prompt prefixes.

use anyhow::bail;
use kvpool_core::{CacheConfig, Request};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Requests generated in total
    #[serde(default = "default_num_requests")]
    pub num_requests: usize,
    /// Distinct shared prefixes ("system prompts") the requests draw from
    #[serde(default = "default_num_prefixes")]
    pub num_prefixes: usize,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: usize,
    /// Request-specific tokens after the shared prefix
    #[serde(default = "default_suffix_len")]
    pub suffix_len: usize,
    /// Tokens generated per request
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// New requests arriving per step
    #[serde(default = "default_arrivals_per_step")]
    pub arrivals_per_step: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_num_requests() -> usize {
    200
}

fn default_num_prefixes() -> usize {
    4
}

fn default_prefix_len() -> usize {
    256
}

fn default_suffix_len() -> usize {
    64
}

fn default_max_tokens() -> usize {
    128
}

fn default_arrivals_per_step() -> usize {
    2
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_requests: default_num_requests(),
            num_prefixes: default_num_prefixes(),
            prefix_len: default_prefix_len(),
            suffix_len: default_suffix_len(),
            max_tokens: default_max_tokens(),
            arrivals_per_step: default_arrivals_per_step(),
            seed: 0,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self, cache: &CacheConfig) -> anyhow::Result<()> {
        if self.num_prefixes == 0 {
            bail!("workload.num_prefixes must be positive");
        }
        if self.prefix_len + self.suffix_len == 0 {
            bail!("workload prompts must not be empty");
        }
        if self.max_tokens == 0 {
            bail!("workload.max_tokens must be positive");
        }
        if self.arrivals_per_step == 0 {
            bail!("workload.arrivals_per_step must be positive");
        }
        let longest = self.prefix_len + self.suffix_len + self.max_tokens;
        if longest > cache.max_model_len {
            bail!(
                "workload requests reach {} tokens, more than max_model_len {}",
                longest,
                cache.max_model_len
            );
        }
        // One request at full length must fit the pool on its own.
        let reserved = usize::from(cache.sliding_window.is_some());
        if longest.div_ceil(cache.block_size) > cache.num_gpu_blocks.saturating_sub(reserved) {
            bail!(
                "workload requests need {} blocks, the pool only has {}",
                longest.div_ceil(cache.block_size),
                cache.num_gpu_blocks
            );
        }
        Ok(())
    }
}

/// Deterministic generator of requests.
pub struct Workload {
    config: WorkloadConfig,
    prefixes: Vec<Vec<u32>>,
    rng: StdRng,
    next_id: usize,
}

const VOCAB_SIZE: u32 = 32_000;

impl Workload {
    pub fn new(config: WorkloadConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let prefixes = (0..config.num_prefixes)
            .map(|_| (0..config.prefix_len).map(|_| rng.gen_range(0..VOCAB_SIZE)).collect())
            .collect();
        Self {
            config,
            prefixes,
            rng,
            next_id: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_id >= self.config.num_requests
    }

    /// Requests arriving in the current step.
    pub fn arrivals(&mut self) -> Vec<Request> {
        let remaining = self.config.num_requests - self.next_id;
        (0..self.config.arrivals_per_step.min(remaining))
            .map(|_| self.next_request())
            .collect()
    }

    /// Token the "model" samples next for a request.
    pub fn sample(&mut self) -> u32 {
        self.rng.gen_range(0..VOCAB_SIZE)
    }

    fn next_request(&mut self) -> Request {
        let prefix = self.rng.gen_range(0..self.prefixes.len());
        let mut prompt = self.prefixes[prefix].clone();
        prompt.extend((0..self.config.suffix_len).map(|_| self.rng.gen_range(0..VOCAB_SIZE)));

        let mut request = Request::new(format!("req-{}", self.next_id), prompt);
        request.sampling_params.max_tokens = self.config.max_tokens;
        self.next_id += 1;
        request
    }
}
