use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use briefing_kernel_core::DEFAULT_KNOWLEDGE_MARKER;
use serde::{Deserialize, Serialize};
use time::Duration;

/// Environment variable holding the summarizer API key.
pub const SUMMARIZER_API_KEY_ENV: &str = "BRIEFING_SUMMARIZER_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BriefingConfig {
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub audit: AuditConfig,
    pub scheduler: SchedulerConfig,
    pub pricing: PricingConfig,
    /// Daily token allotment per agent; agents without an entry are unlimited.
    pub budgets: BTreeMap<String, u64>,
    pub summarizer: SummarizerConfig,
    pub knowledge: KnowledgeConfig,
}

impl BriefingConfig {
    /// Load a YAML configuration file, or the defaults when `path` is `None`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    #[must_use]
    pub fn budget_for(&self, agent: &str) -> Option<u64> {
        self.budgets.get(agent).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// On-demand reads regenerate records older than this.
    pub staleness_hours: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { staleness_hours: 24 }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::hours(i64::from(self.staleness_hours))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub general_window: usize,
    pub handoff_window: usize,
    pub max_prompt_chars: usize,
    pub max_output_tokens: u32,
    /// Ledger agent for briefing regeneration.
    pub regeneration_agent: String,
    /// Ledger agent for interaction digests.
    pub digest_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            general_window: 20,
            handoff_window: 10,
            max_prompt_chars: 12_000,
            max_output_tokens: 1_024,
            regeneration_agent: "context_cache".to_string(),
            digest_agent: "interaction_digest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Lookback of the pattern detector inside a cycle.
    pub pattern_window_hours: u32,
    pub staleness_hours: u32,
    pub activity_lookback_days: u32,
    pub handoff_overdue_hours: u32,
    pub handoff_stuck_hours: u32,
    pub quality_sample_size: usize,
    pub min_summary_length: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            pattern_window_hours: 24,
            staleness_hours: 48,
            activity_lookback_days: 2,
            handoff_overdue_hours: 4,
            handoff_stuck_hours: 24,
            quality_sample_size: 10,
            min_summary_length: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub handoff_sweep_minutes: u64,
    pub staleness_sweep_minutes: u64,
    pub annealing_cycle_minutes: u64,
    pub nightly_refresh_minutes: u64,
    pub nightly_lookback_days: u32,
    pub nightly_batch_size: usize,
    pub nightly_batch_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handoff_sweep_minutes: 120,
            staleness_sweep_minutes: 240,
            annealing_cycle_minutes: 360,
            nightly_refresh_minutes: 1_440,
            nightly_lookback_days: 7,
            nightly_batch_size: 10,
            nightly_batch_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million_usd: f64,
    pub output_per_million_usd: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self { input_per_million_usd: 3.0, output_per_million_usd: 15.0 }
    }
}

impl PricingConfig {
    #[must_use]
    pub fn cost_usd(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_million_usd
            + f64::from(output_tokens) * self.output_per_million_usd)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            api_version: "2023-06-01".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub path: PathBuf,
    pub marker: String,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("KNOWLEDGE.md"), marker: DEFAULT_KNOWLEDGE_MARKER.to_string() }
    }
}
