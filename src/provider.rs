//! Provider data model and registry.
//!
//! The registry is the single owner of provider runtime state. Each provider
//! sits behind its own mutex so that outcome recording for one provider never
//! serializes against another; the outer map lock is held only for
//! lookup/insert/remove. Health and usage counters are eventually consistent
//! under concurrent traffic: a stale read only skews provider preference,
//! never correctness.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use crate::config::{ProviderConfig, RouterConfig};
use crate::util::{epoch_secs, minute_of_epoch};

/// Bounded history length for response times and failure timestamps.
const HISTORY_CAP: usize = 10;

/// Health score applied to newly registered providers.
const INITIAL_HEALTH: f64 = 100.0;

/// Model-family and feature capability flags a provider declares.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Serves "claude" family models.
    pub claude: bool,
    /// Serves "gpt" family models.
    pub gpt: bool,
    /// Serves "llama" family models.
    pub llama: bool,
    /// Serves "deepseek" family models.
    pub deepseek: bool,
    /// Serves reasoning models ("o1", "o3").
    pub reasoning: bool,
    /// Accepts image/audio inputs.
    pub multimodal: bool,
    /// Supports streamed responses.
    pub streaming: bool,
}

/// Usage counters for the current minute-of-epoch window.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageWindow {
    pub requests: u32,
    pub tokens: u64,
    /// Minute-of-epoch the counters belong to.
    pub window_minute: u64,
}

/// One upstream endpoint with its live runtime state.
///
/// Values handed out by the registry are snapshots: cheap clones taken under
/// the provider's lock, safe to score and inspect without further locking.
#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub base_url: String,
    pub priority: u32,
    /// Reputation in [0, 100]; +1 per success, -10 per failure.
    pub health_score: f64,
    pub capabilities: Capabilities,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub usage: UsageWindow,
    /// Last observed latencies in milliseconds, newest at the back.
    pub response_times: VecDeque<u64>,
    /// Epoch-second timestamps of recent failures, newest at the back.
    pub failures: VecDeque<u64>,
    pub api_key_env: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Provider {
    fn from_config(config: ProviderConfig) -> Self {
        Self {
            id: config.id,
            base_url: config.base_url,
            priority: config.priority,
            health_score: INITIAL_HEALTH,
            capabilities: config.capabilities,
            requests_per_minute: config.requests_per_minute,
            tokens_per_minute: config.tokens_per_minute,
            usage: UsageWindow {
                window_minute: minute_of_epoch(),
                ..UsageWindow::default()
            },
            response_times: VecDeque::with_capacity(HISTORY_CAP),
            failures: VecDeque::with_capacity(HISTORY_CAP),
            api_key_env: config.api_key_env,
            headers: config.headers,
        }
    }

    /// Access-triggered window rollover: if the wall-clock minute advanced
    /// past the window, zero the usage counters.
    pub fn roll_window(&mut self, now_minute: u64) {
        if now_minute > self.usage.window_minute {
            self.usage = UsageWindow {
                requests: 0,
                tokens: 0,
                window_minute: now_minute,
            };
        }
    }

    /// Rolling average of the last observed latencies, in milliseconds.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.response_times.iter().sum();
        sum as f64 / self.response_times.len() as f64
    }

    /// Number of recorded failures within the trailing window.
    pub fn recent_failures(&self, now_secs: u64, window_secs: u64) -> usize {
        let cutoff = now_secs.saturating_sub(window_secs);
        self.failures.iter().filter(|&&ts| ts >= cutoff).count()
    }

    /// Usage pressure against configured limits, max of the request and
    /// token ratios. Zero-configured limits contribute no pressure.
    pub fn rate_pressure(&self) -> f64 {
        let req = if self.requests_per_minute == 0 {
            0.0
        } else {
            self.usage.requests as f64 / self.requests_per_minute as f64
        };
        let tok = if self.tokens_per_minute == 0 {
            0.0
        } else {
            self.usage.tokens as f64 / self.tokens_per_minute as f64
        };
        req.max(tok)
    }

    /// Whether the current window has exhausted either configured limit.
    pub fn is_rate_limited(&self) -> bool {
        (self.requests_per_minute > 0 && self.usage.requests >= self.requests_per_minute)
            || (self.tokens_per_minute > 0 && self.usage.tokens >= self.tokens_per_minute)
    }
}

/// Errors from registry mutation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider '{0}' is the designated primary and cannot be removed")]
    PrimaryProtected(String),

    #[error("unknown provider '{0}'")]
    Unknown(String),
}

/// Owned catalog of providers. All mutation goes through this type; callers
/// only ever see snapshots.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<Mutex<Provider>>>>,
    primary: Arc<Mutex<Provider>>,
    primary_id: String,
}

impl ProviderRegistry {
    /// Build the registry from validated configuration.
    pub fn from_config(config: &RouterConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let mut map: HashMap<String, Arc<Mutex<Provider>>> = HashMap::new();
        for pc in &config.providers {
            let provider = Provider::from_config(pc.clone());
            map.insert(pc.id.clone(), Arc::new(Mutex::new(provider)));
        }
        // validate() guarantees the primary is present.
        let primary = map
            .get(&config.primary_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("primary provider missing after validation"))?;

        Ok(Self {
            providers: RwLock::new(map),
            primary,
            primary_id: config.primary_id.clone(),
        })
    }

    /// Id of the designated fallback provider.
    pub fn primary_id(&self) -> &str {
        &self.primary_id
    }

    /// Register a provider, overwriting any existing entry with the same id.
    /// Overwriting the primary replaces its configuration in place so the
    /// fallback handle stays current.
    pub fn add(&self, config: ProviderConfig) {
        let provider = Provider::from_config(config);
        let id = provider.id.clone();

        if id == self.primary_id {
            if let Ok(mut p) = self.primary.lock() {
                *p = provider;
            }
            if let Ok(mut map) = self.providers.write() {
                map.insert(id, self.primary.clone());
            }
            return;
        }

        if let Ok(mut map) = self.providers.write() {
            map.insert(id, Arc::new(Mutex::new(provider)));
        }
    }

    /// Remove a provider. The primary is protected.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        if id == self.primary_id {
            return Err(RegistryError::PrimaryProtected(id.to_string()));
        }
        let mut map = self
            .providers
            .write()
            .map_err(|_| RegistryError::Unknown(id.to_string()))?;
        map.remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::Unknown(id.to_string()))
    }

    fn handle(&self, id: &str) -> Option<Arc<Mutex<Provider>>> {
        self.providers.read().ok()?.get(id).cloned()
    }

    /// Snapshot of one provider after applying the lazy window rollover.
    pub fn snapshot(&self, id: &str) -> Option<Provider> {
        let handle = self.handle(id)?;
        let mut p = handle.lock().ok()?;
        p.roll_window(minute_of_epoch());
        Some(p.clone())
    }

    /// Snapshot of the designated primary provider.
    pub fn primary(&self) -> Provider {
        match self.primary.lock() {
            Ok(mut p) => {
                p.roll_window(minute_of_epoch());
                p.clone()
            }
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Snapshots of all registered providers, rollover applied.
    pub fn list(&self) -> Vec<Provider> {
        let handles: Vec<Arc<Mutex<Provider>>> = match self.providers.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let now_minute = minute_of_epoch();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(mut p) = handle.lock() {
                p.roll_window(now_minute);
                out.push(p.clone());
            }
        }
        out
    }

    /// Record a successful call: bump usage, append latency, nudge health up.
    /// Best-effort; an unknown id is logged and ignored.
    pub fn record_success(&self, id: &str, response_time_ms: u64, tokens_used: u64) {
        let Some(handle) = self.handle(id) else {
            warn!(provider = id, "record_success for unknown provider");
            return;
        };
        if let Ok(mut p) = handle.lock() {
            p.roll_window(minute_of_epoch());
            p.usage.requests = p.usage.requests.saturating_add(1);
            p.usage.tokens = p.usage.tokens.saturating_add(tokens_used);
            p.response_times.push_back(response_time_ms);
            while p.response_times.len() > HISTORY_CAP {
                p.response_times.pop_front();
            }
            p.health_score = (p.health_score + 1.0).min(100.0);
        };
    }

    /// Record a failed call: append the timestamp, drop health.
    /// Best-effort; an unknown id is logged and ignored.
    pub fn record_failure(&self, id: &str) {
        let Some(handle) = self.handle(id) else {
            warn!(provider = id, "record_failure for unknown provider");
            return;
        };
        if let Ok(mut p) = handle.lock() {
            p.failures.push_back(epoch_secs());
            while p.failures.len() > HISTORY_CAP {
                p.failures.pop_front();
            }
            p.health_score = (p.health_score - 10.0).max(0.0);
        };
    }
}
