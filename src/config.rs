use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::evaluator::{ConnectEvaluator, PortEvaluator, SimulatedEvaluator};
use crate::scheduler::{BatchScheduler, DEFAULT_BATCH_SIZE};
use crate::session::{ConflictPolicy, ScanEngine};

/// Which port evaluator backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    /// Random classification from a fixed distribution; no network traffic.
    #[default]
    Simulated,
    /// TCP connect probe with a timeout.
    Connect,
}

/// Engine settings. Every field has a default, so a TOML file only needs the
/// keys it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// Max probes in flight within one batch.
    pub concurrency: usize,
    pub conflict_policy: ConflictPolicy,
    pub evaluator: EvaluatorKind,
    /// Seed for the simulated evaluator; unseeded draws differ on every scan.
    pub seed: Option<u64>,
    /// Connect timeout for the connect evaluator.
    pub timeout_ms: u64,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// When set, API calls must carry `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            inter_batch_delay_ms: 100,
            concurrency: DEFAULT_BATCH_SIZE,
            conflict_policy: ConflictPolicy::Reject,
            evaluator: EvaluatorKind::Simulated,
            seed: None,
            timeout_ms: 400,
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            api_token: None,
        }
    }
}

impl ScanConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid scan configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn build_evaluator(&self) -> Arc<dyn PortEvaluator> {
        match self.evaluator {
            EvaluatorKind::Simulated => match self.seed {
                Some(seed) => Arc::new(SimulatedEvaluator::seeded(seed)),
                None => Arc::new(SimulatedEvaluator::new()),
            },
            EvaluatorKind::Connect => {
                Arc::new(ConnectEvaluator::new(Duration::from_millis(self.timeout_ms)))
            }
        }
    }

    pub fn build_scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(self.batch_size, self.inter_batch_delay())
            .with_concurrency(self.concurrency)
    }

    pub fn build_engine(&self) -> ScanEngine {
        ScanEngine::new_with_policy(
            self.build_evaluator(),
            self.build_scheduler(),
            self.conflict_policy,
        )
    }
}
