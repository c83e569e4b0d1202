//! Per-user sliding one-minute rate limiter.
//!
//! Counters are keyed by integer minute-of-epoch and persisted through the
//! `KvStore` collaborator; no background timer drives expiry. Any access in
//! a later minute resets the stored counter first ("lazy expiry"). The limit
//! itself is recomputed from the user's energy balance on every call, so a
//! balance change takes effect on the very next request.
//!
//! Read-modify-write for a single user is serialized through a per-user
//! async mutex; different users proceed fully in parallel. Lock entries are
//! pruned once no task holds them, so the map tracks active users only and
//! stays bounded over the life of the process.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::balance::BalanceService;
use crate::config::TierLimits;
use crate::store::KvStore;
use crate::util::{millis_until_next_minute, minute_of_epoch};

/// Stored per-user counter; valid only within its minute window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct StoredWindow {
    count: u32,
    minute: u64,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Limit in effect for this user at this moment.
    pub limit: u32,
    /// Requests counted against the current window.
    pub current: u32,
    /// Milliseconds until the window resets.
    pub reset_in_ms: u64,
}

pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    balance: Arc<dyn BalanceService>,
    tiers: TierLimits,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KvStore>,
        balance: Arc<dyn BalanceService>,
        tiers: TierLimits,
    ) -> Self {
        Self {
            store,
            balance,
            tiers,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Requests-per-minute limit for this user right now.
    ///
    /// Premium applies at or above the configured balance threshold. A failed
    /// balance lookup falls back to the default tier; a balance-service
    /// outage must never break the request flow.
    pub async fn user_limit(&self, user_id: &str) -> u32 {
        match self.balance.tokens(user_id).await {
            Ok(Some(tokens)) if tokens >= self.tiers.premium_threshold => {
                self.tiers.premium_per_minute
            }
            Ok(_) => self.tiers.default_per_minute,
            Err(e) => {
                warn!(user = user_id, error = %e, "balance lookup failed, using default tier");
                self.tiers.default_per_minute
            }
        }
    }

    fn key(user_id: &str) -> String {
        format!("{user_id}_rate_limit")
    }

    fn load(&self, user_id: &str) -> Result<StoredWindow> {
        let Some(raw) = self.store.get(&Self::key(user_id))? else {
            return Ok(StoredWindow::default());
        };
        match serde_json::from_slice(&raw) {
            Ok(window) => Ok(window),
            Err(e) => {
                warn!(user = user_id, error = %e, "corrupt rate-limit record, resetting");
                Ok(StoredWindow::default())
            }
        }
    }

    fn persist(&self, user_id: &str, window: StoredWindow) -> Result<()> {
        let raw = serde_json::to_vec(&window)?;
        self.store.set(&Self::key(user_id), &raw)?;
        self.store.commit()?;
        Ok(())
    }

    async fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the user's lock entry once we are its last holder. Handles are
    /// only cloned out under the map lock, so a strong count of exactly two
    /// here (the map's entry plus `handle`) proves no other task is waiting.
    async fn prune_lock(&self, user_id: &str, handle: &Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().await;
        if let Some(entry) = locks.get(user_id) {
            if Arc::ptr_eq(entry, handle) && Arc::strong_count(entry) == 2 {
                locks.remove(user_id);
            }
        }
    }

    /// Load the window, applying (and persisting) the lazy minute rollover.
    fn load_current(&self, user_id: &str, now_minute: u64) -> Result<StoredWindow> {
        let mut window = self.load(user_id)?;
        if now_minute > window.minute {
            window = StoredWindow {
                count: 0,
                minute: now_minute,
            };
            self.persist(user_id, window)?;
        }
        Ok(window)
    }

    /// Inspect the user's window without consuming budget.
    pub async fn check(&self, user_id: &str) -> Result<RateLimitDecision> {
        let limit = self.user_limit(user_id).await;
        let guard = self.lock_for(user_id).await;
        let loaded = {
            let _held = guard.lock().await;
            self.load_current(user_id, minute_of_epoch())
        };
        self.prune_lock(user_id, &guard).await;

        let window = loaded?;
        Ok(RateLimitDecision {
            allowed: window.count < limit,
            limit,
            current: window.count,
            reset_in_ms: millis_until_next_minute(),
        })
    }

    /// Admit one request: if the window has headroom, increment the stored
    /// counter atomically and return the updated count. A rejected request
    /// does not consume budget.
    pub async fn acquire(&self, user_id: &str) -> Result<RateLimitDecision> {
        let limit = self.user_limit(user_id).await;
        let guard = self.lock_for(user_id).await;
        let admitted = {
            let _held = guard.lock().await;
            self.load_current(user_id, minute_of_epoch())
                .and_then(|mut window| {
                    let allowed = window.count < limit;
                    if allowed {
                        window.count += 1;
                        self.persist(user_id, window)?;
                    }
                    Ok((allowed, window))
                })
        };
        self.prune_lock(user_id, &guard).await;

        let (allowed, window) = admitted?;
        debug!(
            user = user_id,
            allowed,
            current = window.count,
            limit,
            "rate-limit decision"
        );
        Ok(RateLimitDecision {
            allowed,
            limit,
            current: window.count,
            reset_in_ms: millis_until_next_minute(),
        })
    }

    #[cfg(test)]
    pub(crate) async fn lock_entries(&self) -> usize {
        self.user_locks.lock().await.len()
    }
}
