//! Background provider health checks.
//!
//! A fixed-interval sweep pings every registered provider off the request
//! path and feeds the result through the same outcome-recording entry points
//! the router uses. Both writers share the registry under its best-effort
//! consistency contract; a racing update only skews scoring momentarily.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::provider::ProviderRegistry;

/// Timeout for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Path probed on each provider's base URL.
const PROBE_PATH: &str = "/models";

/// Spawn the periodic health-check task. Abort the returned handle to stop.
pub fn spawn_health_checks(
    registry: Arc<ProviderRegistry>,
    client: reqwest::Client,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&registry, &client).await;
        }
    })
}

/// Probe every provider once. Successes record the observed latency with
/// zero tokens so pings never distort the token usage window.
async fn sweep(registry: &ProviderRegistry, client: &reqwest::Client) {
    for provider in registry.list() {
        let url = format!("{}{}", provider.base_url.trim_end_matches('/'), PROBE_PATH);
        let started = Instant::now();
        match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(provider = %provider.id, latency_ms, "health probe ok");
                registry.record_success(&provider.id, latency_ms, 0);
            }
            Ok(response) => {
                debug!(provider = %provider.id, status = %response.status(), "health probe failed");
                registry.record_failure(&provider.id);
            }
            Err(e) => {
                debug!(provider = %provider.id, error = %e, "health probe unreachable");
                registry.record_failure(&provider.id);
            }
        }
    }
}
