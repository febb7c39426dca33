//! Scheduler-facing view of an inference request.
//!
//! The request object is owned by the scheduler; the cache manager only reads
//! its tokens, progress counters, sampling flags and lifecycle status.

use serde::{Deserialize, Serialize};

use super::types::RequestId;

/// Lifecycle state of a request.
///
/// `KVCacheManager::get_num_common_prefix_blocks` is only valid for `Running`
/// requests and `KVCacheManager::free_block_hashes` only for `Finished` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestStatus {
    #[default]
    Waiting,
    Running,
    Preempted,
    Finished,
}

impl RequestStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Sampling options the cache manager cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of log-probabilities to return for each prompt token.
    /// Requests asking for them bypass the prefix cache.
    pub prompt_logprobs: Option<usize>,
    /// Maximum number of generated tokens
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            prompt_logprobs: None,
            max_tokens: 256,
        }
    }
}

/// LoRA adapter applied to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoRARequest {
    pub name: String,
    pub id: u32,
}

/// A multimodal input occupying a run of placeholder tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiModalFeature {
    /// Content hash of the media data
    pub identifier: String,
    /// Token position where the placeholder run starts
    pub offset: usize,
    /// Number of placeholder tokens
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    /// Draft tokens proposed by speculative decoding, not yet accepted
    pub spec_token_ids: Vec<u32>,
    /// Tokens whose KV entries are already computed
    pub num_computed_tokens: usize,
    pub status: RequestStatus,
    pub sampling_params: SamplingParams,
    pub lora_request: Option<LoRARequest>,
    /// Isolates this request's cache entries from requests with another salt
    pub cache_salt: Option<String>,
    pub mm_features: Vec<MultiModalFeature>,
}

impl Request {
    pub fn new(request_id: impl Into<RequestId>, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt_token_ids,
            output_token_ids: Vec::new(),
            spec_token_ids: Vec::new(),
            num_computed_tokens: 0,
            status: RequestStatus::Waiting,
            sampling_params: SamplingParams::default(),
            lora_request: None,
            cache_salt: None,
            mm_features: Vec::new(),
        }
    }

    /// Create a request with a freshly minted UUID.
    pub fn with_random_id(prompt_token_ids: Vec<u32>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), prompt_token_ids)
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Prompt plus generated tokens.
    pub fn num_tokens(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn all_token_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.prompt_token_ids
            .iter()
            .chain(self.output_token_ids.iter())
            .copied()
    }

    /// Tokens in `[start, end)` of the prompt-plus-output sequence.
    pub fn token_range(&self, start: usize, end: usize) -> Vec<u32> {
        self.all_token_ids().skip(start).take(end.saturating_sub(start)).collect()
    }

    pub fn append_output_token_ids(&mut self, token_ids: &[u32]) {
        self.output_token_ids.extend_from_slice(token_ids);
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}
