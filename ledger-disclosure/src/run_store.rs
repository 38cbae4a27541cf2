//! Persists the full disclosure run (statement + detail index) alongside
//! the hash chain, keyed by `disclosure_id`, so later proof and reveal
//! requests don't have to recompute the whole period.

use ledger_store::StorageBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::statement::SignedStatement;
use crate::DisclosureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailIndexEntry {
    pub metric_key: String,
    pub group: Value,
    pub event_hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRun {
    pub signed_statement: SignedStatement,
    pub detail_index: Vec<DetailIndexEntry>,
}

impl StoredRun {
    pub fn lookup_detail(&self, metric_key: &str, group: &Value) -> Option<&DetailIndexEntry> {
        self.detail_index
            .iter()
            .find(|entry| entry.metric_key == metric_key && &entry.group == group)
    }
}

fn run_key(disclosure_id: Uuid) -> String {
    format!("disclosure:run:{disclosure_id}")
}

pub async fn store_run<T: StorageBackend>(
    backend: &T,
    disclosure_id: Uuid,
    run: &StoredRun,
) -> Result<(), DisclosureError> {
    let bytes = serde_json::to_vec(run)?;
    backend
        .put(&run_key(disclosure_id), bytes)
        .await
        .map_err(|e| DisclosureError::RunStore(e.to_string()))?;
    Ok(())
}

pub async fn load_run<T: StorageBackend>(
    backend: &T,
    disclosure_id: Uuid,
) -> Result<Option<StoredRun>, DisclosureError> {
    match backend
        .get(&run_key(disclosure_id))
        .await
        .map_err(|e| DisclosureError::RunStore(e.to_string()))?
    {
        Some(bytes) => {
            let run: StoredRun = serde_json::from_slice(&bytes)?;
            Ok(Some(run))
        }
        None => Ok(None),
    }
}
