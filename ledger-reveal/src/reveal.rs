//! Token redemption: the six-step reveal procedure.

use chrono::{DateTime, Utc};
use ledger_crypto::{MacKey, Role};
use ledger_disclosure::load_run;
use ledger_events::{Actor, ActorType, EventCreateRequest, EventPayload};
use ledger_merkle::{Hash, MerkleTree, ProofStep};
use ledger_store::{LedgerStore, StorageBackend};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::token::{RevealEnvelope, Subject, TokenRecord};
use crate::RevealError;

fn token_key(token_id: Uuid) -> String {
    format!("reveal:token:{token_id}")
}

pub async fn store_token_record<T: StorageBackend>(
    backend: &T,
    record: &TokenRecord,
) -> Result<(), RevealError> {
    let bytes = serde_json::to_vec(record)?;
    backend
        .put(&token_key(record.token_id), bytes)
        .await
        .map_err(|e| RevealError::TokenStore(e.to_string()))?;
    Ok(())
}

async fn load_token_record<T: StorageBackend>(
    backend: &T,
    token_id: Uuid,
) -> Result<Option<TokenRecord>, RevealError> {
    match backend
        .get(&token_key(token_id))
        .await
        .map_err(|e| RevealError::TokenStore(e.to_string()))?
    {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealResponse {
    pub disclosure_id: Uuid,
    pub metric_key: String,
    pub group: Value,
    pub detail_root: String,
    pub root_details: Option<String>,
    pub revealed_event_hashes: Vec<String>,
    pub event_proofs: Vec<Vec<ProofStep>>,
}

fn hashes_to_leaves(hashes: &[String]) -> Result<Vec<Hash>, RevealError> {
    hashes
        .iter()
        .map(|h| {
            hex::decode(h)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| RevealError::MalformedEnvelope)
        })
        .collect()
}

/// Redeems `token` for the detail evidence behind `(metric_key, group)`.
/// `requesting_actor_type` is the caller's authenticated identity (`"human"`
/// or `"auditor"`); it must match the actor the token was issued to.
#[allow(clippy::too_many_arguments)]
pub async fn reveal<T: StorageBackend>(
    store: &LedgerStore<T>,
    mac_key: &MacKey,
    disclosure_id: Uuid,
    token: &str,
    metric_key: &str,
    group: &Value,
    requesting_actor_type: &str,
    now: DateTime<Utc>,
) -> Result<RevealResponse, RevealError> {
    let envelope = RevealEnvelope::decode(token)?;
    let claims = envelope.open(mac_key)?;
    if claims.disclosure_id != disclosure_id {
        return Err(RevealError::ScopeMismatch);
    }

    let backend = store.backend();
    let mut record = load_token_record(backend, claims.jti)
        .await?
        .ok_or(RevealError::NotIssued)?;
    if record.disclosure_id != disclosure_id {
        return Err(RevealError::ScopeMismatch);
    }
    if record.used_at.is_some() {
        return Err(RevealError::AlreadyUsed);
    }
    if record.is_expired(now) {
        return Err(RevealError::Expired);
    }
    let expected_actor = Subject::from_actor_type(requesting_actor_type)
        .ok_or(RevealError::ActorMismatch)?;
    if expected_actor != record.issued_to_actor {
        return Err(RevealError::ActorMismatch);
    }

    let run = load_run(backend, disclosure_id)
        .await?
        .ok_or(RevealError::NoDetail)?;
    let entry = run
        .lookup_detail(metric_key, group)
        .ok_or(RevealError::NoDetail)?;
    let leaf = run
        .signed_statement
        .statement
        .commitments
        .leaf_payloads
        .iter()
        .find(|l| l.metric_key == metric_key && &l.group == group)
        .ok_or(RevealError::NoDetail)?;
    let detail_root = leaf.detail_root.clone().ok_or(RevealError::NoDetail)?;

    let mut sorted_hashes = entry.event_hashes.clone();
    sorted_hashes.sort();
    sorted_hashes.dedup();
    let leaf_hashes = hashes_to_leaves(&sorted_hashes)?;
    let tree = MerkleTree::new(leaf_hashes.clone());
    let event_proofs: Vec<Vec<ProofStep>> = (0..leaf_hashes.len())
        .map(|i| tree.proof(i).map_err(RevealError::from))
        .collect::<Result<Vec<_>, _>>()?;

    record.used_at = Some(now);
    store_token_record(backend, &record).await?;

    let payload = EventPayload::SelectiveDisclosureRevealed {
        disclosure_id,
        token_id: record.token_id,
        subject: record.subject.clone(),
        metric_key: metric_key.to_string(),
        group: group.clone(),
        revealed_event_hashes: sorted_hashes.clone(),
    };
    store
        .append(
            EventCreateRequest {
                event_id: None,
                actor: Actor {
                    actor_type: ActorType::Agent,
                    id: "reveal-service".to_string(),
                },
                policy_id: run.signed_statement.statement.policy_id.clone(),
                payload,
                occurred_at: now,
                tool_trace: serde_json::json!({ "reveal_subject": record.subject }),
            },
            Role::Agent,
        )
        .await?;

    Ok(RevealResponse {
        disclosure_id,
        metric_key: metric_key.to_string(),
        group: group.clone(),
        detail_root,
        root_details: run.signed_statement.statement.commitments.root_details.clone(),
        revealed_event_hashes: sorted_hashes,
        event_proofs,
    })
}
