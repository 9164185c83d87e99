//! Orchestrator configuration stored under `.conductor/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::triage::TriageWeights;
use crate::io::ledger::EstimateConfig;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable
/// and automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Daemon poll interval between triage cycles, in seconds.
    pub poll_interval_secs: u64,

    /// Daily spend ceiling gating new admissions.
    pub daily_budget_usd: f64,

    /// Minimum historical samples before medians replace defaults.
    pub min_estimate_samples: usize,

    /// Fallback duration estimate per stage when history is absent.
    pub default_stage_duration_s: f64,

    /// Fallback cost estimate per stage when history is absent.
    pub default_stage_cost_usd: f64,

    /// Self-heal iteration ceiling per run.
    pub max_iterations: u32,

    /// Run the full test command every N heal iterations (subset runs
    /// otherwise, when a subset command is configured).
    pub full_test_every: u32,

    /// Identical failure signatures before the approach-change flag.
    pub signature_repeat_threshold: u32,

    pub auto_extend: AutoExtendConfig,

    /// Seconds between fleet heartbeats.
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age after which a node is marked offline.
    pub heartbeat_timeout_secs: u64,

    /// Worker-slot cap for the local machine.
    pub max_workers: u32,

    /// Local machine name used in the fleet registry.
    pub machine_name: String,

    /// Admission requires at least this much free CPU, in percent.
    pub min_cpu_headroom_pct: f64,

    /// Admission requires at least this much free memory, in percent.
    pub min_mem_headroom_pct: f64,

    /// Wall-clock budget per stage agent invocation, in seconds.
    pub stage_timeout_secs: u64,

    /// Wall-clock budget per test-command invocation, in seconds.
    pub test_timeout_secs: u64,

    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Repository identity used for the memory-index fingerprint.
    /// Empty means "derive from the orchestrator root path".
    pub repo: String,

    /// Stage names to skip for every run (explicit skip list).
    pub skip_stages: Vec<String>,

    pub agent: AgentConfig,
    pub tests: TestConfig,
    pub triage: TriageWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoExtendConfig {
    pub enabled: bool,
    /// Extra iterations granted per extension block.
    pub block_iterations: u32,
    /// Ceiling on extension blocks per run.
    pub max_blocks: u32,
}

impl Default for AutoExtendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_iterations: 3,
            max_blocks: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI program (opaque to the core).
    pub program: String,
    /// Model used when a stage has no explicit entry in `models`.
    pub default_model: String,
    /// Per-stage model overrides (stage name → model identifier).
    pub models: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert("build".to_string(), "large".to_string());
        models.insert("triage".to_string(), "small".to_string());
        Self {
            program: "codex".to_string(),
            default_model: "medium".to_string(),
            models,
        }
    }
}

impl AgentConfig {
    /// Resolve the execution model for a stage.
    pub fn model_for(&self, stage: &str) -> &str {
        self.models
            .get(stage)
            .map_or(self.default_model.as_str(), String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    /// Full test command (e.g. `["just", "ci"]`).
    pub command: Vec<String>,
    /// Faster subset command run on most heal iterations.
    pub subset_command: Option<Vec<String>>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
            subset_command: None,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            daily_budget_usd: 25.0,
            min_estimate_samples: 3,
            default_stage_duration_s: 300.0,
            default_stage_cost_usd: 0.5,
            max_iterations: 5,
            full_test_every: 3,
            signature_repeat_threshold: 3,
            auto_extend: AutoExtendConfig::default(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_workers: 2,
            machine_name: "leader".to_string(),
            min_cpu_headroom_pct: 20.0,
            min_mem_headroom_pct: 15.0,
            stage_timeout_secs: 30 * 60,
            test_timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
            repo: String::new(),
            skip_stages: Vec::new(),
            agent: AgentConfig::default(),
            tests: TestConfig::default(),
            triage: TriageWeights::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.daily_budget_usd <= 0.0 {
            return Err(anyhow!("daily_budget_usd must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.full_test_every == 0 {
            return Err(anyhow!("full_test_every must be > 0"));
        }
        if self.signature_repeat_threshold == 0 {
            return Err(anyhow!("signature_repeat_threshold must be > 0"));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(anyhow!(
                "heartbeat_timeout_secs must exceed heartbeat_interval_secs"
            ));
        }
        if self.stage_timeout_secs == 0 || self.test_timeout_secs == 0 {
            return Err(anyhow!("stage and test timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if !(0.0..100.0).contains(&self.min_cpu_headroom_pct)
            || !(0.0..100.0).contains(&self.min_mem_headroom_pct)
        {
            return Err(anyhow!("headroom margins must be in [0, 100)"));
        }
        if self.tests.command.is_empty() || self.tests.command[0].trim().is_empty() {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        if let Some(subset) = &self.tests.subset_command
            && (subset.is_empty() || subset[0].trim().is_empty())
        {
            return Err(anyhow!("tests.subset_command must be non-empty when set"));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be set"));
        }
        Ok(())
    }

    /// Estimate gating/fallback view for the cost ledger.
    pub fn estimate_config(&self) -> EstimateConfig {
        EstimateConfig {
            min_samples: self.min_estimate_samples,
            default_duration_s: self.default_stage_duration_s,
            default_cost_usd: self.default_stage_cost_usd,
        }
    }
}

/// Load config from a TOML file; missing files yield defaults.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::state_store::write_atomic(path, &buf)
}
