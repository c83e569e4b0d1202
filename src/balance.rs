//! Balance service collaborator: the external ledger holding each user's
//! energy balance. The router only reads it, to derive the rate-limit tier;
//! lookup failures must never take down the request flow.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Read-only view of a user's energy balance.
#[async_trait]
pub trait BalanceService: Send + Sync {
    /// Current balance for `user_id`, or `None` for unknown users.
    async fn tokens(&self, user_id: &str) -> Result<Option<u64>>;
}

#[derive(Debug, Deserialize)]
struct TokenBalance {
    tokens: u64,
}

/// HTTP balance service client: GET `{base_url}/tokens/{user_id}` returning
/// `{"tokens": n}`. 404 maps to an unknown user.
pub struct HttpBalanceService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBalanceService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BalanceService for HttpBalanceService {
    async fn tokens(&self, user_id: &str) -> Result<Option<u64>> {
        let url = format!("{}/tokens/{}", self.base_url.trim_end_matches('/'), user_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("balance service returned {}", response.status());
        }

        let balance: TokenBalance = response.json().await?;
        Ok(Some(balance.tokens))
    }
}

/// Fixed balance table for tests and offline tooling.
#[derive(Default)]
pub struct StaticBalance {
    balances: RwLock<HashMap<String, u64>>,
}

impl StaticBalance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: impl Into<String>, tokens: u64) -> Self {
        let service = Self::new();
        service.set(user_id, tokens);
        service
    }

    pub fn set(&self, user_id: impl Into<String>, tokens: u64) {
        if let Ok(mut map) = self.balances.write() {
            map.insert(user_id.into(), tokens);
        }
    }
}

#[async_trait]
impl BalanceService for StaticBalance {
    async fn tokens(&self, user_id: &str) -> Result<Option<u64>> {
        let map = self
            .balances
            .read()
            .map_err(|_| anyhow::anyhow!("balance table lock poisoned"))?;
        Ok(map.get(user_id).copied())
    }
}
