//! Statement composition and signing.

use chrono::{DateTime, Utc};
use ledger_crypto::{KeyRegistry, Role};
use ledger_reports::ReconciliationReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::commitment::Leaf;
use crate::policy::ProofLevel;
use crate::DisclosureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitments {
    pub root_summary: String,
    pub root_details: Option<String>,
    pub proof_level: ProofLevel,
    pub leaf_schema: String,
    pub leaf_payloads: Vec<Leaf>,
}

pub const LEAF_SCHEMA: &str =
    "{metric_key, group, period_start, period_end, value, policy_id, policy_hash, detail_root?}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisclosureStatement {
    pub disclosure_id: Uuid,
    pub policy_id: String,
    pub policy_hash: String,
    pub period_start: String,
    pub period_end: String,
    pub metrics: Value,
    pub grouped_metrics: Value,
    pub commitments: Commitments,
    pub reconciliation: ReconciliationReport,
    #[serde(with = "ledger_codec::rfc3339")]
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedStatement {
    pub statement: DisclosureStatement,
    pub statement_signature: Vec<u8>,
    pub statement_sig_hash: String,
}

/// Signs the canonical encoding of `statement` with the agent role key —
/// disclosures are machine-compiled and published by the agent, the same
/// role that signs every other automated ledger append.
pub fn sign_statement(
    statement: DisclosureStatement,
    keys: &KeyRegistry,
) -> Result<SignedStatement, DisclosureError> {
    let bytes = ledger_codec::to_canonical_bytes(&statement)?;
    let signature = keys.sign(Role::Agent, &bytes)?;
    let sig_hash_input = serde_json::json!({
        "signature": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &signature),
        "disclosure_id": statement.disclosure_id,
    });
    let statement_sig_hash = ledger_codec::hash_canonical_value(&sig_hash_input)?;
    Ok(SignedStatement {
        statement,
        statement_signature: signature,
        statement_sig_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{build_details_root, build_leaves, build_summary_commitment};
    use crate::compute::ComputeOutput;
    use crate::policy::policy_auditor_v1;
    use std::collections::BTreeMap;

    fn sample_reconciliation() -> ReconciliationReport {
        ReconciliationReport {
            payment_equals_revenue: true,
            inventory_non_negative: true,
            refund_posting_exists: true,
        }
    }

    #[test]
    fn signed_statement_round_trips_through_canonical_bytes() {
        let registry =
            KeyRegistry::from_seeds(&[7u8; 32], &[8u8; 32], &[9u8; 32]).unwrap();
        let policy = policy_auditor_v1();
        let mut metrics = BTreeMap::new();
        metrics.insert("revenue_cents".to_string(), 12_300);
        let output = ComputeOutput {
            metrics,
            grouped_metrics: BTreeMap::new(),
            detail_event_map: BTreeMap::new(),
        };
        let leaves = build_leaves(
            &output,
            &policy,
            "2026-01-01T00:00:00.000000Z",
            "2026-02-01T00:00:00.000000Z",
        );
        let summary = build_summary_commitment(&leaves).unwrap();
        let root_details = build_details_root(&leaves).unwrap();

        let statement = DisclosureStatement {
            disclosure_id: Uuid::new_v4(),
            policy_id: policy.policy_id.clone(),
            policy_hash: policy.policy_hash(),
            period_start: "2026-01-01T00:00:00.000000Z".to_string(),
            period_end: "2026-02-01T00:00:00.000000Z".to_string(),
            metrics: serde_json::to_value(&output.metrics).unwrap(),
            grouped_metrics: serde_json::to_value(&output.grouped_metrics).unwrap(),
            commitments: Commitments {
                root_summary: summary.root_summary,
                root_details,
                proof_level: policy.proof_level,
                leaf_schema: LEAF_SCHEMA.to_string(),
                leaf_payloads: leaves,
            },
            reconciliation: sample_reconciliation(),
            generated_at: Utc::now(),
        };

        let signed = sign_statement(statement, &registry).unwrap();
        assert_eq!(signed.statement_signature.len(), 64);
        assert!(!signed.statement_sig_hash.is_empty());
    }
}
