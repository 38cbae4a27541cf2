//! Double-entry postings, the period P&L, and the publish-time
//! reconciliation checks.
//!
//! The P&L sums posting amounts per account directly rather than
//! round-tripping through a plain-text ledger format and a third-party
//! parser — see `DESIGN.md` for why that extra hop isn't carried over.

use std::collections::BTreeMap;

use ledger_events::EventPayload;
use ledger_events::EventRow;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Account {
    Cash,
    Inventory,
    SalesIncome,
    Cogs,
    Refunds,
    Compensation,
}

impl Account {
    pub fn as_str(self) -> &'static str {
        match self {
            Account::Cash => "Assets:Cash",
            Account::Inventory => "Assets:Inventory",
            Account::SalesIncome => "Income:Sales",
            Account::Cogs => "Expenses:COGS",
            Account::Refunds => "Expenses:Refunds",
            Account::Compensation => "Expenses:Compensation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub event_id: Uuid,
    pub event_type: String,
    pub debit: Account,
    pub credit: Account,
    pub amount: i64,
}

/// Translates scoped events into double-entry postings. `shipment_costs` is
/// the projection engine's per-shipment COGS (keyed by the dispatch event's
/// `event_id`) — P&L cost figures always come from this map, never from an
/// inferred cost.
pub fn events_to_postings(events: &[EventRow], shipment_costs: &BTreeMap<Uuid, i64>) -> Vec<Posting> {
    let mut postings = Vec::new();
    for row in events {
        match &row.payload {
            EventPayload::PaymentCaptured { amount, .. } => postings.push(Posting {
                event_id: row.event_id,
                event_type: row.event_type.clone(),
                debit: Account::Cash,
                credit: Account::SalesIncome,
                amount: *amount,
            }),
            EventPayload::RefundIssued { amount, .. } => postings.push(Posting {
                event_id: row.event_id,
                event_type: row.event_type.clone(),
                debit: Account::Refunds,
                credit: Account::Cash,
                amount: *amount,
            }),
            EventPayload::ShipmentDispatched { .. } => {
                if let Some(cost) = shipment_costs.get(&row.event_id) {
                    if *cost > 0 {
                        postings.push(Posting {
                            event_id: row.event_id,
                            event_type: row.event_type.clone(),
                            debit: Account::Cogs,
                            credit: Account::Inventory,
                            amount: *cost,
                        });
                    }
                }
            }
            EventPayload::GoodsReceived { items, qc_passed, .. } => {
                if *qc_passed {
                    let total: i64 = items.iter().map(|i| i.qty * i.unit_cost).sum();
                    if total > 0 {
                        postings.push(Posting {
                            event_id: row.event_id,
                            event_type: row.event_type.clone(),
                            debit: Account::Inventory,
                            credit: Account::Cash,
                            amount: total,
                        });
                    }
                }
            }
            EventPayload::CompanyCompensationIssued { amount, .. } => postings.push(Posting {
                event_id: row.event_id,
                event_type: row.event_type.clone(),
                debit: Account::Compensation,
                credit: Account::Cash,
                amount: *amount,
            }),
            _ => {}
        }
    }
    postings
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlReport {
    pub income_sales: i64,
    pub cogs: i64,
    pub refunds: i64,
    pub compensation: i64,
    pub net_profit: i64,
    pub posting_count: usize,
}

pub fn generate_pnl(events: &[EventRow], shipment_costs: &BTreeMap<Uuid, i64>) -> PnlReport {
    let postings = events_to_postings(events, shipment_costs);

    let sum_credit = |account: Account| -> i64 {
        postings
            .iter()
            .filter(|p| p.credit == account)
            .map(|p| p.amount)
            .sum()
    };
    let sum_debit = |account: Account| -> i64 {
        postings
            .iter()
            .filter(|p| p.debit == account)
            .map(|p| p.amount)
            .sum()
    };

    let income_sales = sum_credit(Account::SalesIncome);
    let cogs = sum_debit(Account::Cogs);
    let refunds = sum_debit(Account::Refunds);
    let compensation = sum_debit(Account::Compensation);
    let net_profit = income_sales - refunds - cogs - compensation;

    PnlReport {
        income_sales,
        cogs,
        refunds,
        compensation,
        net_profit,
        posting_count: postings.len(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub payment_equals_revenue: bool,
    pub inventory_non_negative: bool,
    pub refund_posting_exists: bool,
}

impl ReconciliationReport {
    pub fn all_pass(&self) -> bool {
        self.payment_equals_revenue && self.inventory_non_negative && self.refund_posting_exists
    }
}

/// Runs the minimum reconciliation set over the events scoped into a
/// disclosure. `disclosed_revenue` is the `revenue_cents` metric the
/// disclosure compiler computed for the same scope.
pub fn reconcile(
    events: &[EventRow],
    disclosed_revenue: i64,
    pnl: &PnlReport,
) -> ReconciliationReport {
    let payment_sum: i64 = events
        .iter()
        .filter_map(|row| match &row.payload {
            EventPayload::PaymentCaptured { amount, .. } => Some(*amount),
            _ => None,
        })
        .sum();

    let refund_sum: i64 = events
        .iter()
        .filter_map(|row| match &row.payload {
            EventPayload::RefundIssued { amount, .. } => Some(*amount),
            _ => None,
        })
        .sum();

    ReconciliationReport {
        payment_equals_revenue: payment_sum == disclosed_revenue,
        inventory_non_negative: ledger_projection::rebuild(events).is_ok(),
        refund_posting_exists: refund_sum == pnl.refunds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ledger_events::{Actor, ActorType};

    fn row(event_id: Uuid, payload: EventPayload) -> EventRow {
        EventRow {
            seq_id: 1,
            event_id,
            event_type: payload.kind_name().to_string(),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
            actor: Actor {
                actor_type: ActorType::Agent,
                id: "agent-test".to_string(),
            },
            policy_id: "default".to_string(),
            payload,
            tool_trace: serde_json::json!({}),
            prev_hash: "0".repeat(64),
            event_hash: "deadbeef".to_string(),
            signature: vec![],
        }
    }

    #[test]
    fn pnl_reflects_payment_refund_and_cogs() {
        let payment_id = Uuid::new_v4();
        let refund_id = Uuid::new_v4();
        let shipment_id = Uuid::new_v4();

        let events = vec![
            row(
                payment_id,
                EventPayload::PaymentCaptured {
                    order_id: "O1".to_string(),
                    amount: 5000,
                    method: "card".to_string(),
                    receipt_object_key: "r1".to_string(),
                    receipt_hash: "h1".to_string(),
                },
            ),
            row(
                refund_id,
                EventPayload::RefundIssued {
                    order_id: "O1".to_string(),
                    amount: 1000,
                    reason: "damaged".to_string(),
                },
            ),
            row(
                shipment_id,
                EventPayload::ShipmentDispatched {
                    order_id: "O1".to_string(),
                    items: vec![],
                    carrier_ref: "C".to_string(),
                },
            ),
        ];
        let mut shipment_costs = BTreeMap::new();
        shipment_costs.insert(shipment_id, 2000);

        let pnl = generate_pnl(&events, &shipment_costs);
        assert_eq!(pnl.income_sales, 5000);
        assert_eq!(pnl.refunds, 1000);
        assert_eq!(pnl.cogs, 2000);
        assert_eq!(pnl.net_profit, 5000 - 1000 - 2000);
    }

    #[test]
    fn reconciliation_passes_on_consistent_scope() {
        let payment_id = Uuid::new_v4();
        let events = vec![row(
            payment_id,
            EventPayload::PaymentCaptured {
                order_id: "O1".to_string(),
                amount: 5000,
                method: "card".to_string(),
                receipt_object_key: "r1".to_string(),
                receipt_hash: "h1".to_string(),
            },
        )];
        let pnl = generate_pnl(&events, &BTreeMap::new());
        let report = reconcile(&events, 5000, &pnl);
        assert!(report.all_pass());
    }
}
