//! Router facade: admit, select, dispatch, record, fall back.
//!
//! One call does the whole request lifecycle: the rate limiter admits or
//! rejects, the scoring engine picks a provider, the HTTP call goes out with
//! a per-request timeout, the outcome is recorded against the registry, and
//! a failure earns exactly one retry against the designated primary before
//! the error is surfaced.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::balance::BalanceService;
use crate::config::{RouterConfig, ScoreWeights};
use crate::provider::{Provider, ProviderRegistry};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::scoring::best_provider_for_model;
use crate::store::KvStore;

/// Per-request routing context supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    /// The request carries image/audio content; multimodal-capable providers
    /// get a scoring bonus.
    pub has_media: bool,
}

/// A successful upstream response, annotated with routing metadata.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    /// Parsed upstream response body.
    pub body: Value,
    /// Provider that ultimately served the request.
    pub served_by: String,
    /// Observed latency of the serving call, in milliseconds.
    pub latency_ms: u64,
    /// Character-length token estimate recorded against the provider.
    pub estimated_tokens: u64,
    /// Whether the primary fallback served after the chosen provider failed.
    pub fallback: bool,
}

/// Router error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The caller exhausted its per-minute budget. Back off `reset_in_ms`.
    #[error("rate limited: {current}/{limit} this minute, retry in {reset_in_ms} ms")]
    RateLimited {
        limit: u32,
        current: u32,
        reset_in_ms: u64,
    },

    /// The selected provider's call failed; a fallback attempt follows when
    /// the provider was not already the primary.
    #[error("provider '{provider}' failed: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// The fallback attempt failed as well; nothing left to try.
    #[error("request could not be served: {message}")]
    Terminal { message: String },

    /// Rate-limit state could not be read or written.
    #[error("storage error: {0}")]
    Store(String),
}

impl From<anyhow::Error> for RouteError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(format!("{e:#}"))
    }
}

struct DispatchOutcome {
    body: Value,
    latency_ms: u64,
    estimated_tokens: u64,
}

pub struct Router {
    registry: Arc<ProviderRegistry>,
    limiter: RateLimiter,
    client: reqwest::Client,
    model_map: HashMap<String, Vec<String>>,
    weights: ScoreWeights,
    endpoint_suffix: String,
    request_timeout: Duration,
}

impl Router {
    /// Wire a router from validated configuration and its collaborators.
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn KvStore>,
        balance: Arc<dyn BalanceService>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let limiter = RateLimiter::new(store, balance, config.tiers);

        Ok(Self {
            registry,
            limiter,
            client,
            model_map: config.model_providers,
            weights: config.weights,
            endpoint_suffix: config.endpoint_suffix,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Shared handle to the provider registry (health checks, admin).
    pub fn registry(&self) -> Arc<ProviderRegistry> {
        self.registry.clone()
    }

    /// The rate limiter, for callers that want to pre-check without routing.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Route one completion request for `user_id` and `model`.
    pub async fn route(
        &self,
        user_id: &str,
        model: &str,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<RoutedResponse, RouteError> {
        let decision = self.limiter.acquire(user_id).await?;
        if !decision.allowed {
            return Err(rate_limited(decision));
        }

        let uuid_hex = uuid::Uuid::new_v4().simple().to_string();
        let request_id = format!("req_{}", &uuid_hex[..12]);
        let request_len = payload.to_string().len();

        let provider = best_provider_for_model(
            &self.registry,
            &self.model_map,
            model,
            ctx,
            &self.weights,
        );
        debug!(
            request_id,
            user = user_id,
            model,
            provider = %provider.id,
            "dispatching"
        );

        match self.dispatch(&provider, payload, request_len).await {
            Ok(outcome) => {
                self.registry.record_success(
                    &provider.id,
                    outcome.latency_ms,
                    outcome.estimated_tokens,
                );
                Ok(routed(outcome, provider.id, false))
            }
            Err(err) => {
                self.registry.record_failure(&provider.id);
                if provider.id == self.registry.primary_id() {
                    warn!(request_id, provider = %provider.id, error = %err, "primary failed, no fallback left");
                    return Err(RouteError::Terminal {
                        message: err.to_string(),
                    });
                }

                warn!(request_id, provider = %provider.id, error = %err, "provider failed, retrying against primary");
                let primary = self.registry.primary();
                match self.dispatch(&primary, payload, request_len).await {
                    Ok(outcome) => {
                        self.registry.record_success(
                            &primary.id,
                            outcome.latency_ms,
                            outcome.estimated_tokens,
                        );
                        info!(request_id, provider = %primary.id, "fallback served the request");
                        Ok(routed(outcome, primary.id, true))
                    }
                    Err(fallback_err) => {
                        self.registry.record_failure(&primary.id);
                        Err(RouteError::Terminal {
                            message: fallback_err.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// One HTTP attempt against one provider. Non-2xx and transport errors
    /// (timeouts included) both come back as `RouteError::Provider`.
    async fn dispatch(
        &self,
        provider: &Provider,
        payload: &Value,
        request_len: usize,
    ) -> Result<DispatchOutcome, RouteError> {
        let url = format!(
            "{}{}",
            provider.base_url.trim_end_matches('/'),
            self.endpoint_suffix
        );

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(payload);
        for (name, value) in &provider.headers {
            builder = builder.header(name, value);
        }
        if let Some(key_env) = &provider.api_key_env {
            if let Ok(key) = std::env::var(key_env) {
                if !key.is_empty() {
                    builder = builder.bearer_auth(key);
                }
            }
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| RouteError::Provider {
            provider: provider.id.clone(),
            status: None,
            message: e.to_string(),
        })?;
        let status = response.status();
        // A connection dropped mid-body is a provider failure, same as a
        // failed send; an empty-body success must not be synthesized here.
        let text = response.text().await.map_err(|e| RouteError::Provider {
            provider: provider.id.clone(),
            status: Some(status.as_u16()),
            message: format!("reading response body: {e}"),
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(RouteError::Provider {
                provider: provider.id.clone(),
                status: Some(status.as_u16()),
                message: if text.is_empty() {
                    format!("upstream returned {status}")
                } else {
                    text
                },
            });
        }

        // Character-length heuristic, ~4 characters per token.
        let estimated_tokens = ((request_len + text.len()) as u64).div_ceil(4);

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(DispatchOutcome {
            body,
            latency_ms,
            estimated_tokens,
        })
    }
}

fn rate_limited(decision: RateLimitDecision) -> RouteError {
    RouteError::RateLimited {
        limit: decision.limit,
        current: decision.current,
        reset_in_ms: decision.reset_in_ms,
    }
}

fn routed(outcome: DispatchOutcome, served_by: String, fallback: bool) -> RoutedResponse {
    RoutedResponse {
        body: outcome.body,
        served_by,
        latency_ms: outcome.latency_ms,
        estimated_tokens: outcome.estimated_tokens,
        fallback,
    }
}
