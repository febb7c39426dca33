//! Prefix cache counters and the telemetry sink interface.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

/// Counters accumulated since the last drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefixCacheStats {
    /// Whether the prefix cache was reset in this interval
    pub reset: bool,
    /// Requests that queried the cache
    pub requests: u64,
    /// Blocks queried
    pub queries: u64,
    /// Blocks found in the cache
    pub hits: u64,
    /// Requests with at least one block hit
    pub request_hits: u64,
    /// Cached blocks evicted to make room
    pub evictions: u64,
    /// Allocations that evicted at least one cached block
    pub request_evictions: u64,
}

impl PrefixCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.queries as f64
        }
    }
}

/// Push interface for block-level cache events.
///
/// Implementations must not block or fail the caller; any export error stays
/// inside the sink.
pub trait CacheTelemetry: Send + Sync {
    fn record_hit(&self, num_blocks: usize, request_id: &str);
    fn record_miss(&self, num_blocks: usize, request_id: &str);
    fn record_eviction(&self, num_blocks: usize, request_id: &str);
}

/// Point-in-time copy of a `RecordingTelemetry`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub total_blocks: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub unique_requests: usize,
    pub requests_with_hits: usize,
    pub requests_with_misses: usize,
    pub requests_with_evictions: usize,
}

#[derive(Default)]
struct Counters {
    total_blocks: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    tracked_requests: HashSet<String>,
    requests_with_hits: HashSet<String>,
    requests_with_misses: HashSet<String>,
    requests_with_evictions: HashSet<String>,
}

/// In-memory sink counting blocks and distinct requests per event kind.
#[derive(Default)]
pub struct RecordingTelemetry {
    counters: Mutex<Counters>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        match self.counters.lock() {
            Ok(c) => TelemetrySnapshot {
                total_blocks: c.total_blocks,
                hits: c.hits,
                misses: c.misses,
                evictions: c.evictions,
                unique_requests: c.tracked_requests.len(),
                requests_with_hits: c.requests_with_hits.len(),
                requests_with_misses: c.requests_with_misses.len(),
                requests_with_evictions: c.requests_with_evictions.len(),
            },
            Err(_) => {
                warn!("Cache telemetry lock poisoned, returning empty snapshot");
                TelemetrySnapshot::default()
            }
        }
    }

    pub fn reset(&self) {
        if let Ok(mut c) = self.counters.lock() {
            *c = Counters::default();
        }
    }

    fn with_counters(&self, f: impl FnOnce(&mut Counters)) {
        match self.counters.lock() {
            Ok(mut c) => f(&mut c),
            Err(_) => warn!("Cache telemetry lock poisoned, dropping event"),
        }
    }
}

impl CacheTelemetry for RecordingTelemetry {
    fn record_hit(&self, num_blocks: usize, request_id: &str) {
        self.with_counters(|c| {
            c.tracked_requests.insert(request_id.to_string());
            if num_blocks > 0 {
                c.requests_with_hits.insert(request_id.to_string());
                c.total_blocks += num_blocks as u64;
                c.hits += num_blocks as u64;
            }
        });
    }

    fn record_miss(&self, num_blocks: usize, request_id: &str) {
        self.with_counters(|c| {
            c.tracked_requests.insert(request_id.to_string());
            if num_blocks > 0 {
                c.requests_with_misses.insert(request_id.to_string());
                c.total_blocks += num_blocks as u64;
                c.misses += num_blocks as u64;
            }
        });
    }

    fn record_eviction(&self, num_blocks: usize, request_id: &str) {
        self.with_counters(|c| {
            c.tracked_requests.insert(request_id.to_string());
            c.requests_with_evictions.insert(request_id.to_string());
            c.evictions += num_blocks as u64;
        });
    }
}
