//! Merkle leaf construction: per-`(metric_key, group)` leaves, the summary
//! tree, and the optional per-leaf detail trees.

use ledger_merkle::{Hash, MerkleTree, ProofStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::compute::ComputeOutput;
use crate::policy::{DisclosurePolicy, ProofLevel};
use crate::DisclosureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    pub metric_key: String,
    pub group: Value,
    pub period_start: String,
    pub period_end: String,
    pub value: i64,
    pub policy_id: String,
    pub policy_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_root: Option<String>,
}

fn leaf_hash(leaf: &Leaf) -> Result<Hash, DisclosureError> {
    let bytes = ledger_codec::to_canonical_bytes(leaf)?;
    Ok(Sha256::digest(&bytes).into())
}

fn group_sort_key(group: &Value) -> String {
    serde_json::to_string(group).unwrap_or_default()
}

/// One leaf per `(metric_key, group)` cell: scalar metrics carry an empty
/// `group` object, grouped metrics one leaf per dimension value. Sorted per
/// `(metric_key, canonical(group), period_start, period_end)`.
pub fn build_leaves(
    output: &ComputeOutput,
    policy: &DisclosurePolicy,
    period_start: &str,
    period_end: &str,
) -> Vec<Leaf> {
    let policy_hash = policy.policy_hash();
    let mut leaves = Vec::new();
    for (key, value) in &output.metrics {
        leaves.push(Leaf {
            metric_key: key.clone(),
            group: serde_json::json!({}),
            period_start: period_start.to_string(),
            period_end: period_end.to_string(),
            value: *value,
            policy_id: policy.policy_id.clone(),
            policy_hash: policy_hash.clone(),
            detail_root: None,
        });
    }
    for (key, rows) in &output.grouped_metrics {
        for row in rows {
            leaves.push(Leaf {
                metric_key: key.clone(),
                group: row.group.clone(),
                period_start: period_start.to_string(),
                period_end: period_end.to_string(),
                value: row.value,
                policy_id: policy.policy_id.clone(),
                policy_hash: policy_hash.clone(),
                detail_root: None,
            });
        }
    }
    leaves.sort_by(|a, b| {
        a.metric_key
            .cmp(&b.metric_key)
            .then_with(|| group_sort_key(&a.group).cmp(&group_sort_key(&b.group)))
            .then_with(|| a.period_start.cmp(&b.period_start))
            .then_with(|| a.period_end.cmp(&b.period_end))
    });
    leaves
}

/// When `policy.proof_level = selective_disclosure_ready`, builds a detail
/// tree per leaf over its sorted, unique source event hashes and fills in
/// `detail_root` before the summary tree is hashed, so the summary root
/// commits to both the aggregate value and the evidence behind it.
pub fn attach_detail_roots(
    leaves: &mut [Leaf],
    output: &ComputeOutput,
    policy: &DisclosurePolicy,
) -> Result<(), DisclosureError> {
    if policy.proof_level != ProofLevel::SelectiveDisclosureReady {
        return Ok(());
    }
    for leaf in leaves.iter_mut() {
        let key = (leaf.metric_key.clone(), group_sort_key(&leaf.group));
        let Some(hashes) = output.detail_event_map.get(&key) else {
            continue;
        };
        let mut sorted_hashes = hashes.clone();
        sorted_hashes.sort();
        sorted_hashes.dedup();
        let leaf_hashes: Result<Vec<Hash>, DisclosureError> = sorted_hashes
            .iter()
            .map(|h| {
                hex::decode(h)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| DisclosureError::MalformedEventHash(h.clone()))
            })
            .collect();
        let tree = MerkleTree::new(leaf_hashes?);
        leaf.detail_root = Some(hex::encode(tree.root()));
    }
    Ok(())
}

pub struct SummaryCommitment {
    pub tree: MerkleTree,
    pub root_summary: String,
}

/// Rebuilds the summary tree from (detail-root-complete) leaves. Both the
/// publish path and the later proof-query path start from the same stored
/// `leaves`, so no tree object needs to be persisted.
pub fn build_summary_commitment(leaves: &[Leaf]) -> Result<SummaryCommitment, DisclosureError> {
    let hashes: Result<Vec<Hash>, DisclosureError> = leaves.iter().map(leaf_hash).collect();
    let tree = MerkleTree::new(hashes?);
    let root_summary = hex::encode(tree.root());
    Ok(SummaryCommitment { tree, root_summary })
}

/// `root_details`: the Merkle root over sorted `(lookup, detail_root)`
/// entries, one per leaf carrying a detail root. `None` when no leaf has
/// one (i.e. the policy isn't selective-disclosure-ready).
pub fn build_details_root(leaves: &[Leaf]) -> Result<Option<String>, DisclosureError> {
    let mut entries: Vec<(String, String)> = leaves
        .iter()
        .filter_map(|l| {
            l.detail_root.as_ref().map(|root| {
                (
                    format!("{}:{}", l.metric_key, group_sort_key(&l.group)),
                    root.clone(),
                )
            })
        })
        .collect();
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort();
    let hashes: Result<Vec<Hash>, DisclosureError> = entries
        .iter()
        .map(|(lookup, root)| {
            let value = serde_json::json!({ "lookup": lookup, "detail_root": root });
            let bytes = ledger_codec::to_canonical_bytes(&value)?;
            Ok(Sha256::digest(&bytes).into())
        })
        .collect();
    let tree = MerkleTree::new(hashes?);
    Ok(Some(hex::encode(tree.root())))
}

pub fn proof_for(
    leaves: &[Leaf],
    tree: &MerkleTree,
    metric_key: &str,
    group: &Value,
) -> Option<Result<Vec<ProofStep>, DisclosureError>> {
    let index = leaves.iter().position(|l| {
        l.metric_key == metric_key && group_sort_key(&l.group) == group_sort_key(group)
    })?;
    Some(tree.proof(index).map_err(DisclosureError::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::policy_auditor_v1;
    use std::collections::BTreeMap;

    #[test]
    fn leaves_sort_deterministically_regardless_of_map_iteration() {
        let mut metrics = BTreeMap::new();
        metrics.insert("revenue_cents".to_string(), 100);
        metrics.insert("orders_count".to_string(), 1);
        let output = ComputeOutput {
            metrics,
            grouped_metrics: BTreeMap::new(),
            detail_event_map: BTreeMap::new(),
        };
        let policy = policy_auditor_v1();
        let leaves = build_leaves(&output, &policy, "2026-01-10T00:00:00.000000Z", "2026-01-11T00:00:00.000000Z");
        assert_eq!(leaves[0].metric_key, "orders_count");
        assert_eq!(leaves[1].metric_key, "revenue_cents");
    }

    #[test]
    fn summary_root_is_deterministic_across_runs() {
        let mut metrics = BTreeMap::new();
        metrics.insert("revenue_cents".to_string(), 5000);
        let output = ComputeOutput {
            metrics,
            grouped_metrics: BTreeMap::new(),
            detail_event_map: BTreeMap::new(),
        };
        let policy = policy_auditor_v1();
        let leaves = build_leaves(&output, &policy, "2026-01-10T00:00:00.000000Z", "2026-01-11T00:00:00.000000Z");
        let a = build_summary_commitment(&leaves).unwrap();
        let b = build_summary_commitment(&leaves).unwrap();
        assert_eq!(a.root_summary, b.root_summary);
    }
}
