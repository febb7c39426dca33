//! Simulator settings, layered from an optional file and `KVPOOL_SIM__*`
//! environment variables.

use std::path::Path;

use anyhow::Context;
use kvpool_core::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;
use crate::workload::WorkloadConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// Steps between progress log lines; 0 disables them
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

fn default_log_interval() -> usize {
    50
}

impl SimConfig {
    /// Load settings. Environment variables override the file, e.g.
    /// `KVPOOL_SIM__CACHE__BLOCK_SIZE=32`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KVPOOL_SIM")
                .separator("__")
                .try_parsing(true),
        );

        let sim: SimConfig = builder
            .build()
            .context("Failed to read simulator settings")?
            .try_deserialize()
            .context("Invalid simulator settings")?;
        sim.cache.validate()?;
        sim.workload.validate(&sim.cache)?;
        Ok(sim)
    }
}
