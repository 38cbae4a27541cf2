//! The external anchor client seam and its strict/degraded write policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::DisclosureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorWriteResult {
    pub key: String,
    pub value: String,
    pub backend: String,
    pub tx_id: Option<String>,
}

#[async_trait]
pub trait AnchorClient: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<AnchorWriteResult, DisclosureError>;
}

/// Process-local anchor used both directly (tests, demos) and as the
/// degraded-mode fallback when a real backend errors or times out.
#[derive(Default)]
pub struct FakeAnchorClient {
    records: Arc<RwLock<HashMap<String, String>>>,
}

impl FakeAnchorClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchorClient for FakeAnchorClient {
    async fn set(&self, key: &str, value: &str) -> Result<AnchorWriteResult, DisclosureError> {
        self.records
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(AnchorWriteResult {
            key: key.to_string(),
            value: value.to_string(),
            backend: "fake".to_string(),
            tx_id: None,
        })
    }
}

/// Writes `key=value` through `client` under `timeout`. Strict mode surfaces
/// a client error as `AnchorUnavailable` and a timeout as `ExternalTimeout`;
/// degraded mode swallows both and falls back to a fresh `FakeAnchorClient`
/// write, so the result still comes back tagged `"fake"`.
pub async fn anchor_write(
    client: &dyn AnchorClient,
    key: &str,
    value: &str,
    timeout: Duration,
    strict: bool,
) -> Result<AnchorWriteResult, DisclosureError> {
    match tokio::time::timeout(timeout, client.set(key, value)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) if strict => Err(DisclosureError::AnchorUnavailable(err.to_string())),
        Err(_) if strict => Err(DisclosureError::ExternalTimeout),
        _ => FakeAnchorClient::new().set(key, value).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyClient;

    #[async_trait]
    impl AnchorClient for FlakyClient {
        async fn set(&self, _key: &str, _value: &str) -> Result<AnchorWriteResult, DisclosureError> {
            Err(DisclosureError::AnchorUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn strict_mode_surfaces_backend_failure() {
        let client = FlakyClient;
        let result = anchor_write(&client, "k", "v", Duration::from_millis(50), true).await;
        assert!(matches!(result, Err(DisclosureError::AnchorUnavailable(_))));
    }

    #[tokio::test]
    async fn degraded_mode_falls_back_to_fake_backend() {
        let client = FlakyClient;
        let result = anchor_write(&client, "k", "v", Duration::from_millis(50), false)
            .await
            .unwrap();
        assert_eq!(result.backend, "fake");
    }

    #[tokio::test]
    async fn fake_client_round_trips_directly() {
        let client = FakeAnchorClient::new();
        let result = anchor_write(&client, "disclosure:1", "root", Duration::from_millis(50), true)
            .await
            .unwrap();
        assert_eq!(result.backend, "fake");
        assert_eq!(result.value, "root");
    }
}
