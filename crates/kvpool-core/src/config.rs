//! Configuration types for the KV cache block manager

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Hash function used to build block hash chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    /// SipHash from the standard library (fast, deterministic keys)
    #[default]
    Builtin,
    /// SHA-256, truncated to 64 bits
    Sha256,
}

/// Cache manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of tokens per block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of physical blocks in the pool
    #[serde(default = "default_num_gpu_blocks")]
    pub num_gpu_blocks: usize,

    /// Maximum sequence length (tokens) of a single request
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Reuse blocks whose token prefix was already computed
    #[serde(default = "default_enable_prefix_caching")]
    pub enable_prefix_caching: bool,

    /// Hash function for the prefix cache
    #[serde(default)]
    pub prefix_caching_hash_algo: HashAlgo,

    /// Tokens worth of blocks handed out beyond the immediate requirement
    #[serde(default = "default_num_preallocate_tokens")]
    pub num_preallocate_tokens: usize,

    /// Sliding attention window in tokens; `None` means full attention
    #[serde(default)]
    pub sliding_window: Option<usize>,

    /// Push hit/miss/eviction counts to an attached telemetry sink
    #[serde(default)]
    pub log_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            num_gpu_blocks: default_num_gpu_blocks(),
            max_model_len: default_max_model_len(),
            enable_prefix_caching: default_enable_prefix_caching(),
            prefix_caching_hash_algo: HashAlgo::default(),
            num_preallocate_tokens: default_num_preallocate_tokens(),
            sliding_window: None,
            log_stats: false,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::ConfigError("block_size must be positive".into()));
        }
        if self.num_gpu_blocks == 0 {
            return Err(Error::ConfigError("num_gpu_blocks must be positive".into()));
        }
        if self.max_model_len == 0 {
            return Err(Error::ConfigError("max_model_len must be positive".into()));
        }
        if self.sliding_window == Some(0) {
            return Err(Error::ConfigError("sliding_window must be positive".into()));
        }
        Ok(())
    }

    /// Preallocation amount converted from tokens to blocks.
    pub fn num_preallocate_blocks(&self) -> usize {
        self.num_preallocate_tokens.div_ceil(self.block_size)
    }

    /// Upper bound on the length of one request's block list.
    pub fn max_num_blocks_per_req(&self) -> usize {
        self.max_model_len.div_ceil(self.block_size)
    }

    /// Attention layout of the cached layers.
    pub fn kv_cache_spec(&self) -> KVCacheSpec {
        KVCacheSpec {
            block_size: self.block_size,
            attention: match self.sliding_window {
                Some(window) => AttentionType::SlidingWindow { window },
                None => AttentionType::Full,
            },
            ..KVCacheSpec::default()
        }
    }
}

fn default_block_size() -> usize {
    16
}

fn default_num_gpu_blocks() -> usize {
    1024
}

fn default_max_model_len() -> usize {
    4096
}

fn default_enable_prefix_caching() -> bool {
    true
}

fn default_num_preallocate_tokens() -> usize {
    64
}

/// Attention pattern of a group of layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionType {
    /// Every past token stays visible
    Full,
    /// Only the last `window` tokens are attended to
    SlidingWindow { window: usize },
}

/// Shape of the KV cache held by one block, for one group of layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVCacheSpec {
    /// Number of tokens per block
    pub block_size: usize,
    /// Number of KV heads
    pub num_kv_heads: usize,
    /// Dimension of each head
    pub head_size: usize,
    /// Data type size in bytes (2 for float16, 4 for float32)
    pub dtype_bytes: usize,
    pub attention: AttentionType,
}

impl Default for KVCacheSpec {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_kv_heads: 8,
            head_size: 128,
            dtype_bytes: 2,
            attention: AttentionType::Full,
        }
    }
}

impl KVCacheSpec {
    /// Bytes held by one block of one layer.
    pub fn page_size_bytes(&self) -> usize {
        // 2 (K+V) * block_size * num_kv_heads * head_size * dtype_bytes
        2 * self.block_size * self.num_kv_heads * self.head_size * self.dtype_bytes
    }

    /// Number of whole blocks that fit in `available_bytes` across `num_layers`.
    pub fn num_blocks_for_memory(&self, available_bytes: usize, num_layers: usize) -> usize {
        let per_block = self.page_size_bytes() * num_layers.max(1);
        if per_block == 0 {
            0
        } else {
            available_bytes / per_block
        }
    }
}
