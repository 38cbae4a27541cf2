//! Ties compute + commitment + statement + anchor together and appends the
//! resulting `DisclosurePublished` event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ledger_crypto::{KeyRegistry, Role};
use ledger_events::{Actor, ActorType, EventCreateRequest, EventPayload, EventRow};
use ledger_store::{LedgerStore, StorageBackend};
use uuid::Uuid;

use crate::anchor::{anchor_write, AnchorClient};
use crate::commitment::{build_details_root, build_leaves, build_summary_commitment, attach_detail_roots};
use crate::compute::{compute_disclosure, ComputeInput};
use crate::policy::DisclosurePolicy;
use crate::run_store::{store_run, DetailIndexEntry, StoredRun};
use crate::statement::{sign_statement, Commitments, DisclosureStatement, SignedStatement, LEAF_SCHEMA};
use crate::DisclosureError;

pub struct PublishRequest<'a> {
    pub policy: &'a DisclosurePolicy,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub group_by: &'a [String],
    pub now: DateTime<Utc>,
    pub anchor_timeout: Duration,
    pub anchor_strict: bool,
}

pub struct DisclosureRun {
    pub signed_statement: SignedStatement,
    pub published_event: EventRow,
}

/// Runs the full publish pipeline: delay gate, compute, commit, sign, anchor,
/// append. Any failure aborts before the event is appended — a disclosure is
/// never partially published.
pub async fn publish<T: StorageBackend>(
    store: &LedgerStore<T>,
    keys: &KeyRegistry,
    anchor: &dyn AnchorClient,
    request: &PublishRequest<'_>,
) -> Result<DisclosureRun, DisclosureError> {
    let earliest_allowed = request.now - chrono::Duration::days(request.policy.delay_days);
    if request.period_end > earliest_allowed {
        return Err(DisclosureError::PeriodTooRecent {
            period_end: request.period_end,
            delay_days: request.policy.delay_days,
        });
    }

    let events = store.list(None, None, None).await?;
    let state = ledger_projection::rebuild(&events)?;

    let scoped_events: Vec<EventRow> = events
        .iter()
        .filter(|row| row.occurred_at >= request.period_start && row.occurred_at < request.period_end)
        .cloned()
        .collect();
    let pnl = ledger_reports::generate_pnl(&scoped_events, &state.shipment_costs);

    let input = ComputeInput {
        events: &events,
        policy: request.policy,
        period_start: request.period_start,
        period_end: request.period_end,
        group_by: request.group_by,
        pnl: &pnl,
    };
    let output = compute_disclosure(&input)?;
    let reconciliation = ledger_reports::reconcile(&scoped_events, pnl.income_sales, &pnl);

    let period_start_str = ledger_codec::format_instant(&request.period_start);
    let period_end_str = ledger_codec::format_instant(&request.period_end);

    let mut leaves = build_leaves(&output, request.policy, &period_start_str, &period_end_str);
    attach_detail_roots(&mut leaves, &output, request.policy)?;
    let summary = build_summary_commitment(&leaves)?;
    let root_details = build_details_root(&leaves)?;

    let detail_index: Vec<DetailIndexEntry> = leaves
        .iter()
        .filter(|leaf| leaf.detail_root.is_some())
        .filter_map(|leaf| {
            let key = (leaf.metric_key.clone(), serde_json::to_string(&leaf.group).ok()?);
            output.detail_event_map.get(&key).map(|hashes| DetailIndexEntry {
                metric_key: leaf.metric_key.clone(),
                group: leaf.group.clone(),
                event_hashes: hashes.clone(),
            })
        })
        .collect();

    let disclosure_id = Uuid::new_v4();
    let statement = DisclosureStatement {
        disclosure_id,
        policy_id: request.policy.policy_id.clone(),
        policy_hash: request.policy.policy_hash(),
        period_start: period_start_str.clone(),
        period_end: period_end_str.clone(),
        metrics: serde_json::to_value(&output.metrics)?,
        grouped_metrics: serde_json::to_value(&output.grouped_metrics)?,
        commitments: Commitments {
            root_summary: summary.root_summary.clone(),
            root_details: root_details.clone(),
            proof_level: request.policy.proof_level,
            leaf_schema: LEAF_SCHEMA.to_string(),
            leaf_payloads: leaves,
        },
        reconciliation,
        generated_at: request.now,
    };
    let signed_statement = sign_statement(statement, keys)?;

    let summary_key = format!("root:summary:{}:{}", period_start_str, request.policy.policy_id);
    let summary_write = anchor_write(
        anchor,
        &summary_key,
        &summary.root_summary,
        request.anchor_timeout,
        request.anchor_strict,
    )
    .await?;
    let mut anchor_ref = format!("{}:{}", summary_write.backend, summary_write.key);
    if let Some(details_root) = &root_details {
        let details_key = format!("root:details:{}:{}", period_start_str, request.policy.policy_id);
        let details_write = anchor_write(
            anchor,
            &details_key,
            details_root,
            request.anchor_timeout,
            request.anchor_strict,
        )
        .await?;
        anchor_ref = format!("{anchor_ref},{}:{}", details_write.backend, details_write.key);
    }

    let disclosure_payload = serde_json::json!({
        "disclosure_id": disclosure_id,
        "policy_id": request.policy.policy_id,
        "period_start": period_start_str,
        "period_end": period_end_str,
        "root_summary": summary.root_summary,
        "root_details": root_details,
        "statement_sig_hash": signed_statement.statement_sig_hash,
    })
    .to_string();
    let disclosure_key = format!("disclosure:{disclosure_id}");
    let disclosure_write = anchor_write(
        anchor,
        &disclosure_key,
        &disclosure_payload,
        request.anchor_timeout,
        request.anchor_strict,
    )
    .await?;
    anchor_ref = format!("{anchor_ref},{}:{}", disclosure_write.backend, disclosure_write.key);

    let payload = EventPayload::DisclosurePublished {
        disclosure_id,
        policy_id: request.policy.policy_id.clone(),
        period_start: period_start_str,
        period_end: period_end_str,
        metrics: signed_statement.statement.metrics.clone(),
        merkle_root: summary.root_summary,
        anchor_ref,
        statement_sig_hash: signed_statement.statement_sig_hash.clone(),
    };
    let published_event = store
        .append(
            EventCreateRequest {
                event_id: Some(disclosure_id),
                actor: Actor {
                    actor_type: ActorType::Agent,
                    id: "disclosure-compiler".to_string(),
                },
                policy_id: request.policy.policy_id.clone(),
                payload,
                occurred_at: request.now,
                tool_trace: serde_json::json!({}),
            },
            Role::Agent,
        )
        .await?;

    store_run(
        store.backend(),
        disclosure_id,
        &StoredRun {
            signed_statement: signed_statement.clone(),
            detail_index,
        },
    )
    .await?;

    Ok(DisclosureRun {
        signed_statement,
        published_event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::FakeAnchorClient;
    use crate::policy::policy_public_v1;
    use chrono::TimeZone;
    use ledger_events::{OrderItem, EventPayload as Payload};
    use ledger_governance::{default_policy, GovernancePolicyEngine};
    use ledger_store::MemoryStorage;
    use std::sync::Arc;

    fn registry() -> Arc<KeyRegistry> {
        Arc::new(KeyRegistry::from_seeds(&[1u8; 32], &[2u8; 32], &[3u8; 32]).unwrap())
    }

    #[tokio::test]
    async fn publish_rejects_a_period_inside_the_delay_window() {
        let keys = registry();
        let governance = Arc::new(GovernancePolicyEngine::new(default_policy()));
        let store = LedgerStore::new(MemoryStorage::new(), keys.clone(), governance);
        let anchor = FakeAnchorClient::new();
        let policy = policy_public_v1();
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let request = PublishRequest {
            policy: &policy,
            period_start: now - chrono::Duration::hours(1),
            period_end: now,
            group_by: &[],
            now,
            anchor_timeout: Duration::from_millis(100),
            anchor_strict: true,
        };
        let result = publish(&store, &keys, &anchor, &request).await;
        assert!(matches!(result, Err(DisclosureError::PeriodTooRecent { .. })));
    }

    #[tokio::test]
    async fn publish_appends_a_disclosure_event_for_a_settled_period() {
        let keys = registry();
        let governance = Arc::new(GovernancePolicyEngine::new(default_policy()));
        let store = LedgerStore::new(MemoryStorage::new(), keys.clone(), governance);
        let anchor = FakeAnchorClient::new();

        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        store
            .append(
                EventCreateRequest {
                    event_id: None,
                    actor: Actor {
                        actor_type: ActorType::Agent,
                        id: "agent-test".to_string(),
                    },
                    policy_id: "default".to_string(),
                    payload: Payload::OrderPlaced {
                        order_id: "O1".to_string(),
                        customer_ref: "C1".to_string(),
                        items: vec![OrderItem {
                            sku: "tomato".to_string(),
                            qty: 1,
                            unit_price: 500,
                        }],
                        channel: "online".to_string(),
                        region: "east".to_string(),
                    },
                    occurred_at: start,
                    tool_trace: serde_json::json!({}),
                },
                Role::Agent,
            )
            .await
            .unwrap();

        let policy = policy_public_v1();
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let request = PublishRequest {
            policy: &policy,
            period_start: start,
            period_end: start + chrono::Duration::days(1),
            group_by: &[],
            now,
            anchor_timeout: Duration::from_millis(100),
            anchor_strict: true,
        };
        let run = publish(&store, &keys, &anchor, &request).await.unwrap();
        assert!(matches!(
            run.published_event.payload,
            EventPayload::DisclosurePublished { .. }
        ));
    }
}
