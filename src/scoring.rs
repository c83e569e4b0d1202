//! Provider scoring and candidate selection.
//!
//! The score is a pure function of a provider snapshot, the requested model,
//! and the request context; lower is better. Scores are recomputed on every
//! request (never cached) because health and usage move continuously.

use std::collections::HashMap;
use tracing::warn;

use crate::config::ScoreWeights;
use crate::provider::{Capabilities, Provider, ProviderRegistry};
use crate::router::RequestContext;
use crate::util::epoch_secs;

/// Whether the provider declares support for the requested model's family.
///
/// Matching is by substring on the model identifier against the known family
/// names. A model that matches no known family is treated as compatible with
/// every provider: a deliberately permissive fallback so unknown models are
/// never starved of candidates.
pub fn model_family_compatible(caps: &Capabilities, model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    let families: [(&str, bool); 6] = [
        ("claude", caps.claude),
        ("gpt", caps.gpt),
        ("llama", caps.llama),
        ("deepseek", caps.deepseek),
        ("o1", caps.reasoning),
        ("o3", caps.reasoning),
    ];

    let mut matched_any = false;
    for (family, supported) in families {
        if m.contains(family) {
            matched_any = true;
            if supported {
                return true;
            }
        }
    }
    !matched_any
}

/// Trailing failure ratio in [0, 1]: failures within the window divided by
/// the configured divisor, clamped.
fn recent_failure_ratio(provider: &Provider, now_secs: u64, weights: &ScoreWeights) -> f64 {
    let failures = provider.recent_failures(now_secs, weights.failure_window_secs) as f64;
    (failures / weights.failure_ratio_divisor).min(1.0)
}

/// Comparative priority score for serving `model` with `provider`.
/// Lower is better.
pub fn score(
    provider: &Provider,
    model: &str,
    ctx: &RequestContext,
    weights: &ScoreWeights,
) -> f64 {
    let mut total = provider.priority as f64 * weights.priority;
    total += (100.0 - provider.health_score) * weights.health_deficit;
    total += provider.rate_pressure() * weights.rate_pressure;
    total += provider.avg_response_time_ms() * weights.latency_ms;
    total += recent_failure_ratio(provider, epoch_secs(), weights) * weights.failure_ratio;

    if model_family_compatible(&provider.capabilities, model) {
        total -= weights.family_bonus;
    }
    if ctx.has_media && provider.capabilities.multimodal {
        total -= weights.multimodal_bonus;
    }

    total
}

/// Candidate filter: a provider is eligible only while its health score is
/// above the floor and its current usage window has headroom. The snapshot is
/// expected to have the lazy window rollover already applied (registry
/// snapshots do).
pub fn is_provider_healthy(provider: &Provider, weights: &ScoreWeights) -> bool {
    provider.health_score > weights.healthy_floor && !provider.is_rate_limited()
}

/// Select the best provider for `model`.
///
/// Candidates come from the model map (defaulting to the primary for
/// unmapped models), are filtered to healthy ones, scored, and the ascending
/// minimum wins. When no candidate is healthy the primary is returned
/// unconditionally: liveness is preferred over strict health enforcement.
pub fn best_provider_for_model(
    registry: &ProviderRegistry,
    model_map: &HashMap<String, Vec<String>>,
    model: &str,
    ctx: &RequestContext,
    weights: &ScoreWeights,
) -> Provider {
    let primary_fallback = vec![registry.primary_id().to_string()];
    let candidate_ids = model_map.get(model).unwrap_or(&primary_fallback);

    let mut best: Option<(f64, Provider)> = None;
    for id in candidate_ids {
        let Some(snapshot) = registry.snapshot(id) else {
            warn!(provider = %id, model, "mapped provider not registered");
            continue;
        };
        if !is_provider_healthy(&snapshot, weights) {
            continue;
        }
        let s = score(&snapshot, model, ctx, weights);
        let improves = match &best {
            Some((current, _)) => s < *current,
            None => true,
        };
        if improves {
            best = Some((s, snapshot));
        }
    }

    match best {
        Some((_, provider)) => provider,
        None => {
            warn!(
                model,
                "no healthy provider among candidates, falling back to primary"
            );
            registry.primary()
        }
    }
}
