//! Block management engine.
//!
//! - `kv_cache`: block pool, prefix cache and the per-request cache manager
//! - `request`: the request view the manager reads
//! - `types`: shared identifiers

pub mod kv_cache;
pub mod request;
pub mod types;

pub use kv_cache::{
    BlockHash, BlockPool, CacheTelemetry, ExtraHashKey, KVCacheManager, KVCacheStats,
    PrefixCacheStats, RecordingTelemetry, TelemetrySnapshot,
};
pub use request::{LoRARequest, MultiModalFeature, Request, RequestStatus, SamplingParams};
pub use types::{BlockId, RequestId};
