//! The append-only signed hash chain over a pluggable async storage backend.
//!
//! Appends are serialized through one lock that reads the latest row and
//! inserts the new one as a single critical section — the chain's
//! linearization point. `verify_chain` replays the whole log and recomputes
//! every hash and signature independently of whatever the store currently
//! holds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ledger_crypto::KeyRegistry;
use ledger_events::{EventCreateRequest, EventRow};
use ledger_governance::GovernancePolicyEngine;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("signer role {signer} does not match actor type {actor_type}")]
    SignerMismatch { actor_type: String, signer: String },
    #[error("governance denied the action{}: {reason}", rule_id.as_ref().map(|r| format!(" (rule {r})")).unwrap_or_default())]
    PolicyEnforcement {
        rule_id: Option<String>,
        reason: String,
    },
    #[error("schema validation failed: {0}")]
    Schema(#[from] ledger_events::EventError),
    #[error("canonicalization failed: {0}")]
    Codec(#[from] ledger_codec::CodecError),
    #[error("event_id {0} already exists in the log")]
    DuplicateEventId(Uuid),
    #[error("event {0} not found")]
    NotFound(Uuid),
    #[error(
        "chain broken at seq_id {seq_id}: expected prev_hash {expected}, found {found}"
    )]
    ChainBroken {
        seq_id: u64,
        expected: String,
        found: String,
    },
    #[error("unknown actor type {0}")]
    UnknownActorType(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    data: Arc<tokio::sync::RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.read().await.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl StorageBackend for SledStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.as_bytes())
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.db
            .contains_key(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, _) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&k).to_string());
        }
        Ok(keys)
    }
}

fn seq_key(seq_id: u64) -> String {
    format!("event:seq:{seq_id:020}")
}

fn id_index_key(event_id: &Uuid) -> String {
    format!("event:id:{event_id}")
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LatestMeta {
    seq_id: u64,
    event_hash: String,
}

const LATEST_META_KEY: &str = "event:meta:latest";

pub struct LedgerStore<T: StorageBackend> {
    backend: T,
    keys: Arc<KeyRegistry>,
    governance: Arc<GovernancePolicyEngine>,
    write_lock: Mutex<()>,
}

impl<T: StorageBackend> LedgerStore<T> {
    pub fn new(backend: T, keys: Arc<KeyRegistry>, governance: Arc<GovernancePolicyEngine>) -> Self {
        Self {
            backend,
            keys,
            governance,
            write_lock: Mutex::new(()),
        }
    }

    /// Direct access to the underlying storage backend, for side records that
    /// live alongside the hash chain (disclosure runs, reveal tokens)
    /// without going through event append/signing.
    pub fn backend(&self) -> &T {
        &self.backend
    }

    async fn load_latest(&self) -> Result<(u64, String), StoreError> {
        match self.backend.get(LATEST_META_KEY).await? {
            Some(bytes) => {
                let meta: LatestMeta =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok((meta.seq_id, meta.event_hash))
            }
            None => Ok((0, ledger_codec::ZERO_HASH.to_string())),
        }
    }

    pub async fn append(
        &self,
        request: EventCreateRequest,
        signer_role: ledger_crypto::Role,
    ) -> Result<EventRow, StoreError> {
        let span = info_span!("ledger_append", event_type = request.payload.kind_name());
        let _enter = span.enter();

        let required = ledger_crypto::required_role_for_actor(request.actor.actor_type.as_str())
            .ok_or_else(|| {
                StoreError::UnknownActorType(request.actor.actor_type.as_str().to_string())
            })?;
        if required != signer_role {
            return Err(StoreError::SignerMismatch {
                actor_type: request.actor.actor_type.as_str().to_string(),
                signer: signer_role.to_string(),
            });
        }

        request.payload.validate()?;

        let action = format!("event:{}", request.payload.kind_name());
        let payload_value = serde_json::to_value(&request.payload)?;
        let approvals: Vec<String> = request
            .tool_trace
            .get("approvals")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let decision = self.governance.evaluate(
            &action,
            request.actor.actor_type.as_str(),
            &signer_role.to_string(),
            &payload_value,
            &request.tool_trace,
            &approvals,
        );
        if !decision.allowed {
            warn!(rule_id = ?decision.rule_id, reason = %decision.reason, "governance denied append");
            return Err(StoreError::PolicyEnforcement {
                rule_id: decision.rule_id,
                reason: decision.reason,
            });
        }

        let event_id = request.event_id.unwrap_or_else(Uuid::new_v4);

        let _guard = self.write_lock.lock().await;

        if self.backend.exists(&id_index_key(&event_id)).await? {
            return Err(StoreError::DuplicateEventId(event_id));
        }

        let (latest_seq, prev_hash) = self.load_latest().await?;
        let seq_id = latest_seq + 1;

        let mut tool_trace = request.tool_trace.clone();
        tool_trace["governance"] = serde_json::to_value(&decision)?;

        let mut row = EventRow {
            seq_id,
            event_id,
            event_type: request.payload.kind_name().to_string(),
            occurred_at: request.occurred_at,
            actor: request.actor.clone(),
            policy_id: request.policy_id.clone(),
            payload: request.payload,
            tool_trace,
            prev_hash: prev_hash.clone(),
            event_hash: String::new(),
            signature: Vec::new(),
        };

        let signed_bytes = ledger_codec::canonicalize_value(&row.signed_view())?;
        row.signature = self.keys.sign(signer_role, &signed_bytes).map_err(|e| {
            StoreError::Backend(format!("signing failed: {e}"))
        })?;
        row.event_hash = ledger_codec::hash_canonical_value(&row.hashed_view())?;

        let bytes = serde_json::to_vec(&row).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.backend.put(&seq_key(seq_id), bytes).await?;
        self.backend
            .put(&id_index_key(&event_id), seq_id.to_string().into_bytes())
            .await?;
        self.backend
            .put(
                LATEST_META_KEY,
                serde_json::to_vec(&LatestMeta {
                    seq_id,
                    event_hash: row.event_hash.clone(),
                })
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            )
            .await?;

        info!(seq_id, event_id = %event_id, "appended event");
        Ok(row)
    }

    pub async fn get(&self, event_id: Uuid) -> Result<Option<EventRow>, StoreError> {
        let Some(seq_bytes) = self.backend.get(&id_index_key(&event_id)).await? else {
            return Ok(None);
        };
        let seq_id: u64 = String::from_utf8_lossy(&seq_bytes)
            .parse()
            .map_err(|_| StoreError::Backend("corrupt id index".to_string()))?;
        self.get_by_seq(seq_id).await
    }

    async fn get_by_seq(&self, seq_id: u64) -> Result<Option<EventRow>, StoreError> {
        match self.backend.get(&seq_key(seq_id)).await? {
            Some(bytes) => {
                let row: EventRow =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// All events in `seq_id` order, optionally narrowed by occurred_at
    /// range and event kinds.
    pub async fn list(
        &self,
        start: Option<chrono::DateTime<chrono::Utc>>,
        end: Option<chrono::DateTime<chrono::Utc>>,
        kinds: Option<&[String]>,
    ) -> Result<Vec<EventRow>, StoreError> {
        let keys = self.backend.list_keys("event:seq:").await?;
        let mut seq_ids: Vec<u64> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("event:seq:"))
            .filter_map(|s| s.parse().ok())
            .collect();
        seq_ids.sort_unstable();

        let mut rows = Vec::with_capacity(seq_ids.len());
        for seq_id in seq_ids {
            if let Some(row) = self.get_by_seq(seq_id).await? {
                if let Some(start) = start {
                    if row.occurred_at < start {
                        continue;
                    }
                }
                if let Some(end) = end {
                    if row.occurred_at >= end {
                        continue;
                    }
                }
                if let Some(kinds) = kinds {
                    if !kinds.iter().any(|k| k == &row.event_type) {
                        continue;
                    }
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Walks the whole log recomputing every `event_hash`/`prev_hash` link
    /// and signature, independent of what's currently stored.
    pub async fn verify_chain(&self) -> Result<bool, StoreError> {
        let rows = self.list(None, None, None).await?;
        let mut expected_prev = ledger_codec::ZERO_HASH.to_string();

        for row in &rows {
            if row.prev_hash != expected_prev {
                warn!(seq_id = row.seq_id, "chain link mismatch");
                return Ok(false);
            }

            let signed_bytes = match ledger_codec::canonicalize_value(&row.signed_view()) {
                Ok(b) => b,
                Err(_) => return Ok(false),
            };
            let required_role =
                match ledger_crypto::required_role_for_actor(row.actor.actor_type.as_str()) {
                    Some(r) => r,
                    None => return Ok(false),
                };
            let verifying_key = match self.keys.key(required_role) {
                Ok(k) => k.verifying_key(),
                Err(_) => return Ok(false),
            };
            let sig_ok = ledger_crypto::KeyRegistry::verify(
                verifying_key.as_bytes(),
                &signed_bytes,
                &row.signature,
            )
            .unwrap_or(false);
            if !sig_ok {
                warn!(seq_id = row.seq_id, "signature verification failed");
                return Ok(false);
            }

            let recomputed_hash = match ledger_codec::hash_canonical_value(&row.hashed_view()) {
                Ok(h) => h,
                Err(_) => return Ok(false),
            };
            if recomputed_hash != row.event_hash {
                warn!(seq_id = row.seq_id, "event_hash mismatch");
                return Ok(false);
            }

            expected_prev = row.event_hash.clone();
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ledger_events::{Actor, ActorType, EventPayload, GoodsReceivedItem, ProcurementItem};

    fn agent_actor() -> Actor {
        Actor {
            actor_type: ActorType::Agent,
            id: "agent-test".to_string(),
        }
    }

    fn store() -> LedgerStore<MemoryStorage> {
        let registry =
            KeyRegistry::from_seeds(&[1u8; 32], &[2u8; 32], &[3u8; 32]).unwrap();
        let governance = GovernancePolicyEngine::new(ledger_governance::default_policy());
        LedgerStore::new(MemoryStorage::new(), Arc::new(registry), Arc::new(governance))
    }

    #[tokio::test]
    async fn append_and_verify_chain() {
        let store = store();
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();

        let req1 = EventCreateRequest {
            event_id: None,
            actor: agent_actor(),
            policy_id: "default".to_string(),
            payload: EventPayload::ProcurementOrdered {
                procurement_id: "P1".to_string(),
                supplier_id: "S1".to_string(),
                items: vec![ProcurementItem {
                    sku: "tomato".to_string(),
                    qty: 100,
                    unit_cost: 200,
                }],
                expected_date: "2026-01-11".to_string(),
            },
            occurred_at: ts,
            tool_trace: serde_json::json!({}),
        };
        let row1 = store.append(req1, ledger_crypto::Role::Agent).await.unwrap();
        assert_eq!(row1.seq_id, 1);
        assert_eq!(row1.prev_hash, ledger_codec::ZERO_HASH);

        let req2 = EventCreateRequest {
            event_id: None,
            actor: agent_actor(),
            policy_id: "default".to_string(),
            payload: EventPayload::GoodsReceived {
                procurement_id: "P1".to_string(),
                batch_id: "B1".to_string(),
                items: vec![GoodsReceivedItem {
                    sku: "tomato".to_string(),
                    qty: 100,
                    expiry_date: "2026-01-20".to_string(),
                    unit_cost: 200,
                }],
                qc_passed: true,
            },
            occurred_at: ts,
            tool_trace: serde_json::json!({}),
        };
        let row2 = store.append(req2, ledger_crypto::Role::Agent).await.unwrap();
        assert_eq!(row2.prev_hash, row1.event_hash);

        assert!(store.verify_chain().await.unwrap());
    }

    #[tokio::test]
    async fn signer_mismatch_is_rejected() {
        let store = store();
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let req = EventCreateRequest {
            event_id: None,
            actor: Actor {
                actor_type: ActorType::Human,
                id: "h1".to_string(),
            },
            policy_id: "default".to_string(),
            payload: EventPayload::RefundIssued {
                order_id: "O1".to_string(),
                amount: 500,
                reason: "damaged".to_string(),
            },
            occurred_at: ts,
            tool_trace: serde_json::json!({}),
        };
        let result = store.append(req, ledger_crypto::Role::Agent).await;
        assert!(matches!(result, Err(StoreError::SignerMismatch { .. })));
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = store();
        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let fixed_id = Uuid::new_v4();
        let make_req = || EventCreateRequest {
            event_id: Some(fixed_id),
            actor: agent_actor(),
            policy_id: "default".to_string(),
            payload: EventPayload::SkillRunStarted {
                run_id: "r1".to_string(),
                skill_name: "demo".to_string(),
                input_digest: "abc".to_string(),
            },
            occurred_at: ts,
            tool_trace: serde_json::json!({}),
        };
        store
            .append(make_req(), ledger_crypto::Role::Agent)
            .await
            .unwrap();
        let second = store.append(make_req(), ledger_crypto::Role::Agent).await;
        assert!(matches!(second, Err(StoreError::DuplicateEventId(_))));
    }

    #[tokio::test]
    async fn sled_backend_persists_and_verifies_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger-sled");
        let backend = SledStorage::open(path.to_str().unwrap()).unwrap();
        let registry = KeyRegistry::from_seeds(&[1u8; 32], &[2u8; 32], &[3u8; 32]).unwrap();
        let governance = GovernancePolicyEngine::new(ledger_governance::default_policy());
        let store = LedgerStore::new(backend, Arc::new(registry), Arc::new(governance));

        let ts = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let req = EventCreateRequest {
            event_id: None,
            actor: agent_actor(),
            policy_id: "default".to_string(),
            payload: EventPayload::ProcurementOrdered {
                procurement_id: "P1".to_string(),
                supplier_id: "S1".to_string(),
                items: vec![ProcurementItem {
                    sku: "tomato".to_string(),
                    qty: 100,
                    unit_cost: 200,
                }],
            },
            occurred_at: ts,
            tool_trace: serde_json::json!({}),
        };
        store.append(req, ledger_crypto::Role::Agent).await.unwrap();

        assert!(store.verify_chain().await.unwrap());
        let events = store.list(None, None, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
