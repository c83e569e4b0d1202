//! Router configuration: provider bootstrap entries, model-to-provider
//! mapping, scoring weights, and rate-limit tiers.
//!
//! Every tunable lives here as a named value with a serde default, so the
//! scoring formula and tier policy can be adjusted (or pinned in tests)
//! without touching scattered literals.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::provider::Capabilities;

/// Identifier of the designated fallback provider unless overridden.
pub const DEFAULT_PRIMARY_ID: &str = "primary";

/// Scoring weights for provider selection. Lower composite score wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Multiplier on the provider's configured priority tier.
    pub priority: f64,

    /// Multiplier on (100 - health_score).
    pub health_deficit: f64,

    /// Multiplier on rate-limit pressure, max(requests/rpm, tokens/tpm).
    pub rate_pressure: f64,

    /// Multiplier on the rolling average response time in milliseconds.
    pub latency_ms: f64,

    /// Multiplier on the trailing failure ratio.
    pub failure_ratio: f64,

    /// Subtracted when the provider declares the requested model family.
    pub family_bonus: f64,

    /// Subtracted when the request carries media and the provider is
    /// multimodal-capable.
    pub multimodal_bonus: f64,

    /// Providers at or below this health score are filtered out before
    /// scoring.
    pub healthy_floor: f64,

    /// Trailing window, in seconds, for counting recent failures.
    pub failure_window_secs: u64,

    /// Failure count is divided by this before clamping to [0, 1].
    pub failure_ratio_divisor: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priority: 10.0,
            health_deficit: 0.5,
            rate_pressure: 20.0,
            latency_ms: 0.01,
            failure_ratio: 50.0,
            family_bonus: 5.0,
            multimodal_bonus: 10.0,
            healthy_floor: 50.0,
            failure_window_secs: 300,
            failure_ratio_divisor: 5.0,
        }
    }
}

/// Per-user rate-limit tiers, selected by current energy balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimits {
    /// Requests per minute for users below the premium threshold, and the
    /// fallback whenever the balance lookup fails.
    pub default_per_minute: u32,

    /// Requests per minute for users at or above the premium threshold.
    pub premium_per_minute: u32,

    /// Energy balance at which the premium tier activates.
    pub premium_threshold: u64,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            default_per_minute: 10,
            premium_per_minute: 30,
            premium_threshold: 50_000,
        }
    }
}

/// Bootstrap configuration for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider identifier.
    pub id: String,

    /// Base URL, e.g. "https://api.openai.com/v1".
    pub base_url: String,

    /// Priority tier; lower is preferred.
    #[serde(default)]
    pub priority: u32,

    /// Model-family and feature capability flags.
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Provider-enforced requests per minute.
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Provider-enforced tokens per minute.
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,

    /// Environment variable holding the API key for this provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Extra headers sent with every request to this provider.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_rpm() -> u32 {
    60
}

fn default_tpm() -> u64 {
    100_000
}

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Providers registered at startup. Must include the primary.
    pub providers: Vec<ProviderConfig>,

    /// Model identifier -> ordered eligible provider ids. Models absent from
    /// the map fall through to the primary provider.
    #[serde(default)]
    pub model_providers: HashMap<String, Vec<String>>,

    /// Id of the designated fallback provider. Cannot be removed at runtime.
    #[serde(default = "default_primary_id")]
    pub primary_id: String,

    /// Path appended to a provider's base URL on dispatch.
    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,

    /// Scoring weights.
    #[serde(default)]
    pub weights: ScoreWeights,

    /// Rate-limit tiers.
    #[serde(default)]
    pub tiers: TierLimits,

    /// Per-dispatch timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between background health-check sweeps, in seconds.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

fn default_primary_id() -> String {
    DEFAULT_PRIMARY_ID.to_string()
}

fn default_endpoint_suffix() -> String {
    "/chat/completions".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_health_check_secs() -> u64 {
    60
}

impl RouterConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RouterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the primary provider exists and ids are unique.
    pub fn validate(&self) -> Result<()> {
        if !self.providers.iter().any(|p| p.id == self.primary_id) {
            return Err(anyhow!(
                "primary provider '{}' is not among configured providers",
                self.primary_id
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.as_str()) {
                return Err(anyhow!("duplicate provider id '{}'", p.id));
            }
        }
        Ok(())
    }
}
