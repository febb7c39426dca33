//! kvpool Core - Paged KV Cache Block Manager
//!
//! This crate tracks the physical KV cache blocks of an LLM serving engine:
//! which blocks each request owns, which blocks hold reusable prompt
//! prefixes, and which unreferenced blocks get recycled first.
//!
//! # Architecture
//!
//! The manager follows vLLM's v1 block management with:
//! - A fixed pool of blocks with reference counts
//! - Chained block hashes as content identity for prefix caching
//! - LRU eviction of unreferenced cached blocks
//! - Full and sliding-window attention policies
//!
//! # Example
//!
//! ```ignore
//! use kvpool_core::{CacheConfig, KVCacheManager, Request};
//!
//! let mut manager = KVCacheManager::new(CacheConfig::default())?;
//! let request = Request::new("req-0", prompt_token_ids);
//!
//! let (computed, num_computed) = manager.get_computed_blocks(&request);
//! let new_blocks = manager.allocate_slots(&request, request.num_tokens() - num_computed, &computed)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::{AttentionType, CacheConfig, HashAlgo, KVCacheSpec};
pub use engine::{
    BlockHash, BlockId, CacheTelemetry, KVCacheManager, KVCacheStats, PrefixCacheStats,
    RecordingTelemetry, Request, RequestId, RequestStatus, SamplingParams, TelemetrySnapshot,
};
pub use error::{Error, Result};
