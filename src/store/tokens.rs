//! Bootstrap-token exchange.
//!
//! Configuration delivery carries a token valid for a few minutes. It is
//! exchanged exactly once for a long-lived API token via the issuance
//! endpoint, and only the long-lived token is persisted — webhook
//! processing that arrives after the bootstrap token expires can still
//! authenticate to the model backend.

use crate::errors::{SwitchboardError, SwitchboardResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct IssuedToken {
    token: String,
}

pub struct TokenExchanger {
    client: Client,
    endpoint: String,
}

impl TokenExchanger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: endpoint.into(),
        }
    }

    /// Trade a short-lived bootstrap token for a persistent API token.
    pub async fn exchange(&self, bootstrap_token: &str) -> SwitchboardResult<String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(bootstrap_token)
            .json(&serde_json::json!({ "grant_type": "bootstrap" }))
            .send()
            .await
            .map_err(|e| SwitchboardError::Store {
                tier: "token-exchange",
                message: format!("issuance call failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SwitchboardError::Store {
                tier: "token-exchange",
                message: format!("issuance returned {}", status),
            });
        }

        let issued: IssuedToken = resp.json().await.map_err(|e| SwitchboardError::Store {
            tier: "token-exchange",
            message: format!("unreadable issuance response: {}", e),
        })?;
        debug!("exchanged bootstrap token for persistent API token");
        Ok(issued.token)
    }
}
