//! kvpool Simulator - drives the block manager with a synthetic workload
//!
//! Usage: `kvpool-sim [settings.toml]`. The settings path may also come from
//! `KVPOOL_SIM_CONFIG`; individual values from `KVPOOL_SIM__<SECTION>__<KEY>`.

use std::path::PathBuf;
use std::sync::Arc;

use kvpool_core::{KVCacheManager, PrefixCacheStats, RecordingTelemetry, TelemetrySnapshot};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod settings;
mod scheduler;
mod workload;

use settings::SimConfig;
use scheduler::Scheduler;
use workload::Workload;

/// Totals printed as JSON when the workload completes.
#[derive(Debug, Default, Serialize)]
struct SimReport {
    steps: usize,
    finished_requests: usize,
    preemptions: usize,
    prefill_tokens: usize,
    cached_prompt_tokens: usize,
    peak_usage: f64,
    prefix_cache: PrefixCacheStats,
    prefix_cache_hit_rate: f64,
    telemetry: TelemetrySnapshot,
}

impl SimReport {
    fn add_prefix_cache_stats(&mut self, stats: &PrefixCacheStats) {
        let total = &mut self.prefix_cache;
        total.reset |= stats.reset;
        total.requests += stats.requests;
        total.queries += stats.queries;
        total.hits += stats.hits;
        total.request_hits += stats.request_hits;
        total.evictions += stats.evictions;
        total.request_evictions += stats.request_evictions;
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvpool_sim=info,kvpool_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KVPOOL_SIM_CONFIG").ok())
        .map(PathBuf::from);
    let sim = SimConfig::load(config_path.as_deref())?;
    info!(
        "Starting kvpool simulator: {} blocks of {} tokens, prefix caching {}",
        sim.cache.num_gpu_blocks,
        sim.cache.block_size,
        if sim.cache.enable_prefix_caching { "on" } else { "off" }
    );

    let telemetry = Arc::new(RecordingTelemetry::new());
    let mut kv_cache = KVCacheManager::new(sim.cache.clone())?.with_telemetry(telemetry.clone());
    let mut scheduler = Scheduler::new(sim.scheduler.clone());
    let mut workload = Workload::new(sim.workload.clone());
    let mut report = SimReport::default();

    while !workload.is_exhausted() || scheduler.has_unfinished_requests() {
        for request in workload.arrivals() {
            scheduler.add_request(request);
        }

        let step = scheduler.step(&mut kv_cache, &mut workload)?;
        report.steps += 1;
        report.finished_requests += step.num_finished;
        report.preemptions += step.num_preempted;
        report.prefill_tokens += step.num_prefill_tokens;
        report.cached_prompt_tokens += step.num_cached_tokens;
        report.peak_usage = report.peak_usage.max(kv_cache.usage());

        let stats = kv_cache.make_prefix_cache_stats();
        report.add_prefix_cache_stats(&stats);

        if sim.log_interval > 0 && report.steps % sim.log_interval == 0 {
            let usage = kv_cache.stats();
            info!(
                "step {}: running={}, waiting={}, blocks used={}/{} ({} cached), hit rate={:.1}%",
                report.steps,
                scheduler.num_running(),
                scheduler.num_waiting(),
                usage.used_blocks,
                usage.total_blocks,
                usage.cached_blocks,
                report.prefix_cache.hit_rate() * 100.0
            );
        }
    }

    report.prefix_cache_hit_rate = report.prefix_cache.hit_rate();
    report.telemetry = telemetry.snapshot();
    info!(
        "Simulation finished after {} steps ({} requests, {} preemptions)",
        report.steps, report.finished_requests, report.preemptions
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
