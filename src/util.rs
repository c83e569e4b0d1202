use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Loads a `.env` file from the working directory if present (existing
/// environment variables win), then installs a fmt subscriber filtered by
/// RUST_LOG (default "info"). Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    let env_loaded = dotenvy::dotenv().is_ok();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if env_loaded {
        tracing::info!("environment loaded from .env");
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    env_nonempty(key)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}

fn env_u64(key: &str) -> Option<u64> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}

/// Build the shared HTTP client the router and its collaborators dispatch
/// through, honoring proxy and timeout environment variables.
///
/// Environment:
/// - MODELGATE_NO_PROXY = 1|true|yes|on   -> disable all proxies
/// - MODELGATE_PROXY_URL = <url>          -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY             -> scheme-specific proxies
/// - MODELGATE_HTTP_TIMEOUT_SECONDS       -> client-wide request timeout
///
/// Every request carries a versioned `modelgate/x.y.z` user agent so
/// upstream providers can attribute traffic. The router applies its own
/// per-dispatch timeout (`RouterConfig::request_timeout_secs`) on top of
/// the client-wide one configured here.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("modelgate/{}", env!("CARGO_PKG_VERSION")));

    if let Some(secs) = env_u64("MODELGATE_HTTP_TIMEOUT_SECONDS") {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    if env_flag("MODELGATE_NO_PROXY") {
        builder = builder.no_proxy();
    } else {
        if let Some(url) = env_nonempty("MODELGATE_PROXY_URL") {
            match reqwest::Proxy::all(&url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => tracing::warn!(url, error = %e, "ignoring invalid MODELGATE_PROXY_URL"),
            }
        }
        if let Some(url) = env_nonempty("HTTP_PROXY").or_else(|| env_nonempty("http_proxy")) {
            if let Ok(proxy) = reqwest::Proxy::http(&url) {
                builder = builder.proxy(proxy);
            }
        }
        if let Some(url) = env_nonempty("HTTPS_PROXY").or_else(|| env_nonempty("https_proxy")) {
            if let Ok(proxy) = reqwest::Proxy::https(&url) {
                builder = builder.proxy(proxy);
            }
        }
    }

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Integer minute-of-epoch identifying the current rate-limit window.
///
/// Window comparisons throughout the crate use this value, never elapsed
/// durations: two calls in the same wall-clock minute share a window even if
/// they straddle process restarts.
pub fn minute_of_epoch() -> u64 {
    epoch_secs() / 60
}

/// Milliseconds until the next minute-of-epoch boundary.
pub fn millis_until_next_minute() -> u64 {
    60_000 - (epoch_millis() % 60_000)
}
