#![forbid(unsafe_code)]
#![doc = r#"
Modelgate

Adaptive multi-provider router for generative AI requests. Given a pool of
upstream API endpoints, Modelgate picks the one most likely to serve a request
well (live health score, rate-limit headroom, latency history, recent
failures), dispatches the HTTP call, records the outcome so future choices
adapt, and retries once against a designated primary provider on failure.
A per-user sliding one-minute rate limit with balance-derived tiers gates
admission in front of the router.

Crate highlights
- `ProviderRegistry`: single-writer catalog of upstream endpoints with
  per-provider interior mutability; the only mutation entry points for
  health/usage state are `record_success` / `record_failure`.
- `scoring`: pure comparative scoring (lower is better) over provider
  snapshots; all weights live in `ScoreWeights`, not scattered literals.
- `RateLimiter`: access-triggered minute-window counters persisted in a
  pluggable `KvStore`, with tiers derived from a `BalanceService`.
- `Router`: the facade wiring admission, selection, dispatch, outcome
  recording, and bounded (single) fallback together.

Modules
- `config`: tunable weights, tier limits, provider bootstrap config.
- `provider`: provider data model and registry.
- `scoring`: score composition, health filter, candidate selection.
- `rate_limit`: per-user sliding-window limiter.
- `router`: facade and error taxonomy.
- `health`: background provider pings, off the request path.
- `balance`, `store`: external collaborator interfaces (balance service,
  key-value persistence) with default implementations.
- `util`: tracing/env bootstrap and HTTP client construction.
"#]

pub mod balance;
pub mod config;
pub mod health;
pub mod provider;
pub mod rate_limit;
pub mod router;
pub mod scoring;
pub mod store;
pub mod util;

pub use crate::balance::{BalanceService, HttpBalanceService, StaticBalance};
pub use crate::config::{
    ProviderConfig, RouterConfig, ScoreWeights, TierLimits, DEFAULT_PRIMARY_ID,
};
pub use crate::health::spawn_health_checks;
pub use crate::provider::{Capabilities, Provider, ProviderRegistry, RegistryError, UsageWindow};
pub use crate::rate_limit::{RateLimitDecision, RateLimiter};
pub use crate::router::{RequestContext, RouteError, RoutedResponse, Router};
pub use crate::scoring::{best_provider_for_model, is_provider_healthy, score};
pub use crate::store::{KvStore, MemoryStore, SledStore};
