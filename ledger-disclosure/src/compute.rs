//! Scoping, aggregation and grouping of ledger events into a disclosure's
//! metric set.
//!
//! Input is the *full* event log, not a pre-scoped slice: a handful of
//! metrics (inventory turnover, the supplier term buckets) need to look
//! outside the `[period_start, period_end)` window — at the inventory value
//! just before the window opened, or at the most recent supplier contract on
//! file — so scoping happens once, here, rather than being the caller's
//! responsibility.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ledger_events::EventPayload;
use ledger_events::EventRow;
use ledger_reports::PnlReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::DisclosurePolicy;
use crate::DisclosureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedRow {
    pub group: Value,
    pub value: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ComputeOutput {
    pub metrics: BTreeMap<String, i64>,
    pub grouped_metrics: BTreeMap<String, Vec<GroupedRow>>,
    /// Keyed by `(metric_key, canonical group JSON text)`.
    pub detail_event_map: BTreeMap<(String, String), Vec<String>>,
}

pub struct ComputeInput<'a> {
    pub events: &'a [EventRow],
    pub policy: &'a DisclosurePolicy,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub group_by: &'a [String],
    pub pnl: &'a PnlReport,
}

fn in_scope(row: &EventRow, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    row.occurred_at >= start && row.occurred_at < end
}

fn group_key(group: &Value) -> String {
    serde_json::to_string(group).expect("group is a plain JSON object of strings")
}

fn scalar_group() -> Value {
    serde_json::json!({})
}

struct DetailTracker {
    map: BTreeMap<(String, String), BTreeSet<String>>,
}

impl DetailTracker {
    fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn record(&mut self, metric_key: &str, group: &Value, event_hash: &str) {
        self.map
            .entry((metric_key.to_string(), group_key(group)))
            .or_default()
            .insert(event_hash.to_string());
    }

    fn into_sorted(self) -> BTreeMap<(String, String), Vec<String>> {
        self.map
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect()
    }
}

fn bps(numerator: i64, denominator: i64) -> i64 {
    if denominator > 0 {
        (numerator * 10_000) / denominator
    } else {
        0
    }
}

const WASTE_KEYWORDS: &[&str] = &["expire", "waste", "loss", "damaged"];

fn supplier_term_bucket(days: i64) -> &'static str {
    if days <= 7 {
        "le7"
    } else if days <= 14 {
        "8to14"
    } else {
        "gt14"
    }
}

/// Scopes `events` to `[period_start, period_end)`, computes every scalar and
/// grouped metric named in the catalog, intersects with
/// `policy.allowed_metrics`/`allowed_group_by`, and records which source
/// event hashes back each resulting cell.
pub fn compute_disclosure(input: &ComputeInput<'_>) -> Result<ComputeOutput, DisclosureError> {
    for dim in input.group_by {
        if !input.policy.allows_group_by(dim) {
            return Err(DisclosureError::GroupByNotAllowed(dim.clone()));
        }
    }

    let scoped: Vec<&EventRow> = input
        .events
        .iter()
        .filter(|row| in_scope(row, input.period_start, input.period_end))
        .collect();

    let mut tracker = DetailTracker::new();
    let mut out = ComputeOutput::default();

    // order_id -> (channel, region)
    let mut order_location: BTreeMap<String, (String, String)> = BTreeMap::new();
    // order_id -> (sku, line_revenue) lines, and order_id -> total line revenue
    let mut order_lines: BTreeMap<String, Vec<(String, i64)>> = BTreeMap::new();
    let mut order_customer: BTreeMap<String, String> = BTreeMap::new();

    for row in &scoped {
        if let EventPayload::OrderPlaced {
            order_id,
            customer_ref,
            items,
            channel,
            region,
        } = &row.payload
        {
            order_location.insert(order_id.clone(), (channel.clone(), region.clone()));
            order_customer.insert(order_id.clone(), customer_ref.clone());
            order_lines.insert(
                order_id.clone(),
                items.iter().map(|i| (i.sku.clone(), i.qty * i.unit_price)).collect(),
            );
        }
    }

    let order_revenue = |order_id: &str| -> i64 {
        order_lines
            .get(order_id)
            .map(|lines| lines.iter().map(|(_, rev)| *rev).sum())
            .unwrap_or(0)
    };

    // --- revenue ---
    let mut revenue = 0i64;
    let mut revenue_by_channel: BTreeMap<String, i64> = BTreeMap::new();
    let mut revenue_by_region: BTreeMap<String, i64> = BTreeMap::new();
    let mut revenue_by_sku: BTreeMap<String, i64> = BTreeMap::new();

    for row in &scoped {
        if let EventPayload::PaymentCaptured { amount, .. } = &row.payload {
            revenue += amount;
            let group = scalar_group();
            tracker.record("revenue_cents", &group, &row.event_hash);
        }
    }
    for (order_id, lines) in &order_lines {
        let location = order_location.get(order_id);
        for (sku, line_revenue) in lines {
            *revenue_by_sku.entry(sku.clone()).or_insert(0) += line_revenue;
            if let Some((channel, region)) = location {
                *revenue_by_channel.entry(channel.clone()).or_insert(0) += line_revenue;
                *revenue_by_region.entry(region.clone()).or_insert(0) += line_revenue;
            }
        }
    }

    // --- refunds ---
    let mut refunds = 0i64;
    let mut refunds_by_channel: BTreeMap<String, i64> = BTreeMap::new();
    let mut refunds_by_region: BTreeMap<String, i64> = BTreeMap::new();
    let mut refunds_by_sku: BTreeMap<String, i64> = BTreeMap::new();
    for row in &scoped {
        if let EventPayload::RefundIssued { order_id, amount, .. } = &row.payload {
            refunds += amount;
            if let Some((channel, region)) = order_location.get(order_id) {
                *refunds_by_channel.entry(channel.clone()).or_insert(0) += amount;
                *refunds_by_region.entry(region.clone()).or_insert(0) += amount;
            }
            let order_rev = order_revenue(order_id);
            if order_rev > 0 {
                if let Some(lines) = order_lines.get(order_id) {
                    for (sku, line_revenue) in lines {
                        let share = (line_revenue * amount) / order_rev;
                        *refunds_by_sku.entry(sku.clone()).or_insert(0) += share;
                    }
                }
            }
            tracker.record("refunds_cents", &scalar_group(), &row.event_hash);
        }
    }

    // --- compensation ---
    let mut compensation = 0i64;
    let mut compensation_by_channel: BTreeMap<String, i64> = BTreeMap::new();
    let mut compensation_by_region: BTreeMap<String, i64> = BTreeMap::new();
    let mut compensation_by_sku: BTreeMap<String, i64> = BTreeMap::new();
    let mut compensation_events_by_order: BTreeMap<String, Vec<DateTime<Utc>>> = BTreeMap::new();
    for row in &scoped {
        if let EventPayload::CompanyCompensationIssued { order_id, amount, .. } = &row.payload {
            compensation += amount;
            if let Some((channel, region)) = order_location.get(order_id) {
                *compensation_by_channel.entry(channel.clone()).or_insert(0) += amount;
                *compensation_by_region.entry(region.clone()).or_insert(0) += amount;
            }
            let order_rev = order_revenue(order_id);
            if order_rev > 0 {
                if let Some(lines) = order_lines.get(order_id) {
                    for (sku, line_revenue) in lines {
                        let share = (line_revenue * amount) / order_rev;
                        *compensation_by_sku.entry(sku.clone()).or_insert(0) += share;
                    }
                }
            }
            tracker.record("compensation_cents", &scalar_group(), &row.event_hash);
        }
    }
    for row in input.events {
        if let EventPayload::CompanyCompensationIssued { order_id, .. } = &row.payload {
            compensation_events_by_order
                .entry(order_id.clone())
                .or_default()
                .push(row.occurred_at);
        }
    }

    // --- shipment_qty ---
    let mut shipment_qty = 0i64;
    let mut shipment_by_channel: BTreeMap<String, i64> = BTreeMap::new();
    let mut shipment_by_region: BTreeMap<String, i64> = BTreeMap::new();
    let mut shipment_by_sku: BTreeMap<String, i64> = BTreeMap::new();
    for row in &scoped {
        if let EventPayload::ShipmentDispatched { order_id, items, .. } = &row.payload {
            let total: i64 = items.iter().map(|i| i.qty).sum();
            shipment_qty += total;
            if let Some((channel, region)) = order_location.get(order_id) {
                *shipment_by_channel.entry(channel.clone()).or_insert(0) += total;
                *shipment_by_region.entry(region.clone()).or_insert(0) += total;
            }
            for item in items {
                *shipment_by_sku.entry(item.sku.clone()).or_insert(0) += item.qty;
            }
            tracker.record("shipment_qty", &scalar_group(), &row.event_hash);
        }
    }

    // --- conflicts ---
    let mut conflict_count = 0i64;
    let mut conflict_by_channel: BTreeMap<String, i64> = BTreeMap::new();
    let mut conflict_by_region: BTreeMap<String, i64> = BTreeMap::new();
    for row in &scoped {
        if let EventPayload::CustomerConflictReported { order_id, .. } = &row.payload {
            conflict_count += 1;
            if let Some((channel, region)) = order_location.get(order_id) {
                *conflict_by_channel.entry(channel.clone()).or_insert(0) += 1;
                *conflict_by_region.entry(region.clone()).or_insert(0) += 1;
            }
            tracker.record("conflict_count", &scalar_group(), &row.event_hash);
        }
    }

    let orders_count = order_lines.keys().count() as i64;

    // --- repeat purchase rate ---
    let mut orders_per_customer: BTreeMap<String, i64> = BTreeMap::new();
    for customer in order_customer.values() {
        *orders_per_customer.entry(customer.clone()).or_insert(0) += 1;
    }
    let distinct_customers = orders_per_customer.len() as i64;
    let repeat_customers = orders_per_customer.values().filter(|&&c| c >= 2).count() as i64;

    // --- inventory turnover (needs full-log rebuilds at the window edges) ---
    let before_open: Vec<EventRow> = input
        .events
        .iter()
        .filter(|r| r.occurred_at < input.period_start)
        .cloned()
        .collect();
    let before_close: Vec<EventRow> = input
        .events
        .iter()
        .filter(|r| r.occurred_at < input.period_end)
        .cloned()
        .collect();
    let inv_value = |rows: &[EventRow]| -> i64 {
        ledger_projection::rebuild(rows)
            .map(|state| {
                state
                    .inventory
                    .values()
                    .map(|lot| lot.qty_on_hand * lot.unit_cost)
                    .sum()
            })
            .unwrap_or(0)
    };
    let inv_open = inv_value(&before_open);
    let inv_close = inv_value(&before_close);
    let period_days = (input.period_end - input.period_start).num_days().max(1);
    let inventory_turnover_days = if input.pnl.cogs > 0 {
        (period_days * (inv_open + inv_close) / 2) / input.pnl.cogs
    } else {
        0
    };

    // --- slow-moving sku ratio ---
    let closing_state = ledger_projection::rebuild(&before_close).unwrap_or_default();
    let skus_with_stock: BTreeSet<String> = closing_state
        .inventory
        .values()
        .filter(|lot| lot.qty_on_hand > 0)
        .map(|lot| lot.sku.clone())
        .collect();
    let shipped_skus: BTreeSet<String> = shipment_by_sku.keys().cloned().collect();
    let slow_moving = skus_with_stock.difference(&shipped_skus).count() as i64;
    let slow_moving_sku_ratio_bps = bps(slow_moving, skus_with_stock.len() as i64);

    // --- complaint resolution ---
    let mut resolution_hours: Vec<f64> = Vec::new();
    for row in &scoped {
        if let EventPayload::ComplaintLogged {
            order_id, opened_at, ..
        } = &row.payload
        {
            if let Some(compensations) = compensation_events_by_order.get(order_id) {
                if let Some(resolved_at) = compensations.iter().filter(|t| **t >= *opened_at).min() {
                    let hours = (*resolved_at - *opened_at).num_seconds() as f64 / 3600.0;
                    resolution_hours.push(hours);
                }
            }
        }
    }
    let complaint_resolution_hours_avg = if resolution_hours.is_empty() {
        0
    } else {
        (resolution_hours.iter().sum::<f64>() / resolution_hours.len() as f64).floor() as i64
    };

    // --- supplier settlement + term buckets ---
    let mut supplier_terms: BTreeMap<String, Vec<(DateTime<Utc>, i64)>> = BTreeMap::new();
    for row in input.events {
        if let EventPayload::SupplierContractSigned {
            supplier_id,
            payment_term_days,
            ..
        } = &row.payload
        {
            supplier_terms
                .entry(supplier_id.clone())
                .or_default()
                .push((row.occurred_at, *payment_term_days));
        }
    }
    let term_for = |supplier_id: &str, at: DateTime<Utc>| -> Option<i64> {
        supplier_terms.get(supplier_id).and_then(|contracts| {
            contracts
                .iter()
                .filter(|(signed_at, _)| *signed_at <= at)
                .max_by_key(|(signed_at, _)| *signed_at)
                .map(|(_, days)| *days)
        })
    };

    let mut supplier_settlements = 0i64;
    let mut settlement_by_bucket: BTreeMap<&'static str, i64> = BTreeMap::new();
    let mut term_days_sum = 0i64;
    let mut term_days_count = 0i64;
    for row in &scoped {
        if let EventPayload::ProcurementOrdered {
            supplier_id, items, ..
        } = &row.payload
        {
            let amount: i64 = items.iter().map(|i| i.qty * i.unit_cost).sum();
            supplier_settlements += amount;
            if let Some(days) = term_for(supplier_id, row.occurred_at) {
                *settlement_by_bucket.entry(supplier_term_bucket(days)).or_insert(0) += amount;
                term_days_sum += days;
                term_days_count += 1;
            }
            tracker.record("supplier_settlement_cents", &scalar_group(), &row.event_hash);
        }
    }
    let supplier_avg_term_days = if term_days_count > 0 {
        term_days_sum / term_days_count
    } else {
        0
    };

    // --- inventory waste ---
    let mut waste_qty = 0i64;
    let mut waste_value = 0i64;
    for row in &scoped {
        if let EventPayload::InventoryAdjusted {
            qty_delta,
            reason,
            unit_cost,
            ..
        } = &row.payload
        {
            let reason_lower = reason.to_lowercase();
            let is_waste = *qty_delta < 0 && WASTE_KEYWORDS.iter().any(|kw| reason_lower.contains(kw));
            if is_waste {
                let qty = -qty_delta;
                waste_qty += qty;
                waste_value += qty * unit_cost.unwrap_or(0);
                tracker.record("inventory_waste_qty", &scalar_group(), &row.event_hash);
            }
        }
    }

    // --- assemble scalar metrics ---
    let net_revenue = revenue - refunds - compensation;
    let gross_profit = revenue - refunds - input.pnl.cogs;
    let operating_cash_net_inflow = revenue - refunds - compensation - supplier_settlements;

    let all_scalars: Vec<(&str, i64)> = vec![
        ("revenue_cents", revenue),
        ("refunds_cents", refunds),
        ("compensation_cents", compensation),
        ("net_revenue_cents", net_revenue),
        ("orders_count", orders_count),
        ("shipment_qty", shipment_qty),
        ("refund_rate_bps", bps(refunds, revenue)),
        ("conflict_count", conflict_count),
        ("conflict_rate_bps", bps(conflict_count, orders_count)),
        ("gross_profit_cents", gross_profit),
        ("gross_margin_bps", bps(gross_profit, revenue)),
        (
            "avg_order_value_cents",
            if orders_count > 0 { revenue / orders_count } else { 0 },
        ),
        (
            "repeat_purchase_rate_bps",
            bps(repeat_customers, distinct_customers),
        ),
        ("inventory_turnover_days", inventory_turnover_days),
        ("slow_moving_sku_ratio_bps", slow_moving_sku_ratio_bps),
        ("complaint_resolution_hours_avg", complaint_resolution_hours_avg),
        ("operating_cash_net_inflow_cents", operating_cash_net_inflow),
        (
            "supplier_term_le7_bps",
            bps(*settlement_by_bucket.get("le7").unwrap_or(&0), supplier_settlements),
        ),
        (
            "supplier_term_8to14_bps",
            bps(*settlement_by_bucket.get("8to14").unwrap_or(&0), supplier_settlements),
        ),
        (
            "supplier_term_gt14_bps",
            bps(*settlement_by_bucket.get("gt14").unwrap_or(&0), supplier_settlements),
        ),
        ("supplier_avg_term_days", supplier_avg_term_days),
        ("inventory_waste_qty", waste_qty),
        ("inventory_waste_value_cents", waste_value),
    ];
    for (key, value) in all_scalars {
        if input.policy.allows_metric(key) {
            out.metrics.insert(key.to_string(), value);
        }
    }

    // --- assemble grouped metrics ---
    let mut push_group = |metric_key: &str, dim: &str, values: &BTreeMap<String, i64>| {
        if !input.group_by.iter().any(|d| d == dim) || !input.policy.allows_metric(metric_key) {
            return;
        }
        if dim == "sku" && !input.policy.redaction.allow_sku {
            return;
        }
        let rows: Vec<GroupedRow> = values
            .iter()
            .map(|(v, amount)| GroupedRow {
                group: serde_json::json!({ dim: v }),
                value: *amount,
            })
            .collect();
        out.grouped_metrics
            .entry(metric_key.to_string())
            .or_insert_with(Vec::new)
            .extend(rows);
    };

    push_group("revenue_cents", "channel", &revenue_by_channel);
    push_group("revenue_cents", "region", &revenue_by_region);
    push_group("revenue_cents", "sku", &revenue_by_sku);
    push_group("shipment_qty", "channel", &shipment_by_channel);
    push_group("shipment_qty", "region", &shipment_by_region);
    push_group("shipment_qty", "sku", &shipment_by_sku);
    push_group("refunds_cents", "channel", &refunds_by_channel);
    push_group("refunds_cents", "region", &refunds_by_region);
    push_group("refunds_cents", "sku", &refunds_by_sku);
    push_group("conflict_count", "channel", &conflict_by_channel);
    push_group("conflict_count", "region", &conflict_by_region);
    push_group("compensation_cents", "channel", &compensation_by_channel);
    push_group("compensation_cents", "region", &compensation_by_region);
    push_group("compensation_cents", "sku", &compensation_by_sku);

    if input.policy.allows_metric("supplier_settlement_cents") {
        let rows: Vec<GroupedRow> = settlement_by_bucket
            .iter()
            .map(|(bucket, amount)| GroupedRow {
                group: serde_json::json!({ "payment_term_bucket": bucket }),
                value: *amount,
            })
            .collect();
        if !rows.is_empty() {
            out.grouped_metrics
                .insert("supplier_settlement_cents".to_string(), rows);
        }
    }

    out.detail_event_map = tracker.into_sorted();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::policy_public_v1;
    use chrono::TimeZone;
    use ledger_events::{Actor, ActorType, OrderItem, ShipmentItem};
    use uuid::Uuid;

    fn row(occurred_at: DateTime<Utc>, payload: EventPayload) -> EventRow {
        EventRow {
            seq_id: 1,
            event_id: Uuid::new_v4(),
            event_type: payload.kind_name().to_string(),
            occurred_at,
            actor: Actor {
                actor_type: ActorType::Agent,
                id: "agent-test".to_string(),
            },
            policy_id: "default".to_string(),
            payload,
            tool_trace: serde_json::json!({}),
            prev_hash: "0".repeat(64),
            event_hash: Uuid::new_v4().to_string(),
            signature: vec![],
        }
    }

    #[test]
    fn scenario_three_matches_expected_scalars() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap();
        let events = vec![
            row(
                start,
                EventPayload::OrderPlaced {
                    order_id: "O1".to_string(),
                    customer_ref: "C1".to_string(),
                    items: vec![OrderItem {
                        sku: "tomato".to_string(),
                        qty: 10,
                        unit_price: 500,
                    }],
                    channel: "online".to_string(),
                    region: "east".to_string(),
                },
            ),
            row(
                start,
                EventPayload::PaymentCaptured {
                    order_id: "O1".to_string(),
                    amount: 5000,
                    method: "card".to_string(),
                    receipt_object_key: "r1".to_string(),
                    receipt_hash: "h1".to_string(),
                },
            ),
            row(
                start,
                EventPayload::ShipmentDispatched {
                    order_id: "O1".to_string(),
                    items: vec![ShipmentItem {
                        sku: "tomato".to_string(),
                        qty: 10,
                    }],
                    carrier_ref: "CARRIER".to_string(),
                },
            ),
        ];
        let pnl = PnlReport {
            income_sales: 5000,
            cogs: 2000,
            refunds: 0,
            compensation: 0,
            net_profit: 3000,
            posting_count: 2,
        };
        let policy = policy_public_v1();
        let input = ComputeInput {
            events: &events,
            policy: &policy,
            period_start: start,
            period_end: end,
            group_by: &["channel".to_string()],
            pnl: &pnl,
        };
        let output = compute_disclosure(&input).unwrap();
        assert_eq!(output.metrics["revenue_cents"], 5000);
        assert_eq!(output.metrics["refunds_cents"], 0);
        assert_eq!(output.metrics["orders_count"], 1);
        assert_eq!(output.metrics["refund_rate_bps"], 0);
    }

    #[test]
    fn rejects_group_by_outside_policy() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap();
        let events: Vec<EventRow> = vec![];
        let pnl = PnlReport {
            income_sales: 0,
            cogs: 0,
            refunds: 0,
            compensation: 0,
            net_profit: 0,
            posting_count: 0,
        };
        let policy = policy_public_v1();
        let input = ComputeInput {
            events: &events,
            policy: &policy,
            period_start: start,
            period_end: end,
            group_by: &["sku".to_string()],
            pnl: &pnl,
        };
        let result = compute_disclosure(&input);
        assert!(matches!(result, Err(DisclosureError::GroupByNotAllowed(_))));
    }
}
