//! Deterministic read-model rebuild: order view and FIFO-costed inventory.
//!
//! Both views are pure functions of the event sequence. A rebuild always
//! starts from empty state and replays every row in `seq_id` order; there is
//! no incremental path in this crate, so "rebuild twice, get the same
//! answer" is true by construction rather than by careful bookkeeping.

use std::collections::BTreeMap;

use ledger_events::{EventPayload, EventRow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("consuming {qty} of sku {sku} would drive a lot negative")]
    NegativeInventory { sku: String, qty: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderStatus {
    Placed,
    Paid,
    Shipped,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub qty: i64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: String,
    pub customer_ref: String,
    pub channel: String,
    pub region: String,
    pub items: Vec<OrderLine>,
    pub paid_minor_units: i64,
    pub refunded_minor_units: i64,
    pub shipped_qty: i64,
    pub status: OrderStatus,
}

impl OrderView {
    fn revenue(&self) -> i64 {
        self.items.iter().map(|i| i.qty * i.unit_price).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryLot {
    pub sku: String,
    pub batch_id: String,
    pub qty_on_hand: i64,
    pub expiry_date: String,
    pub unit_cost: i64,
}

/// `(sku, batch_id)` — the FIFO consumption key.
pub type LotKey = (String, String);

#[derive(Debug, Default)]
pub struct ProjectionState {
    pub orders: BTreeMap<String, OrderView>,
    pub inventory: BTreeMap<LotKey, InventoryLot>,
    pub shipment_costs: BTreeMap<Uuid, i64>,
}

fn apply_order_event(orders: &mut BTreeMap<String, OrderView>, row: &EventRow) {
    match &row.payload {
        EventPayload::OrderPlaced {
            order_id,
            customer_ref,
            items,
            channel,
            region,
        } => {
            orders.insert(
                order_id.clone(),
                OrderView {
                    order_id: order_id.clone(),
                    customer_ref: customer_ref.clone(),
                    channel: channel.clone(),
                    region: region.clone(),
                    items: items
                        .iter()
                        .map(|i| OrderLine {
                            sku: i.sku.clone(),
                            qty: i.qty,
                            unit_price: i.unit_price,
                        })
                        .collect(),
                    paid_minor_units: 0,
                    refunded_minor_units: 0,
                    shipped_qty: 0,
                    status: OrderStatus::Placed,
                },
            );
        }
        EventPayload::PaymentCaptured { order_id, amount, .. } => {
            if let Some(order) = orders.get_mut(order_id) {
                order.paid_minor_units += amount;
                if order.status < OrderStatus::Paid {
                    order.status = OrderStatus::Paid;
                }
            }
        }
        EventPayload::ShipmentDispatched { order_id, items, .. } => {
            if let Some(order) = orders.get_mut(order_id) {
                order.shipped_qty += items.iter().map(|i| i.qty).sum::<i64>();
                if order.status < OrderStatus::Shipped {
                    order.status = OrderStatus::Shipped;
                }
            }
        }
        EventPayload::RefundIssued { order_id, amount, .. } => {
            if let Some(order) = orders.get_mut(order_id) {
                order.refunded_minor_units += amount;
                if *amount > 0 {
                    order.status = OrderStatus::Refunded;
                }
            }
        }
        _ => {}
    }
}

/// Consumes `qty` units of `sku` across its lots in `(expiry_date asc,
/// batch_id asc)` order. Returns the total cost of the consumption, or
/// `NegativeInventory` if the sku's on-hand total is short — in which case
/// `inventory` is left untouched.
fn consume_fifo(
    inventory: &mut BTreeMap<LotKey, InventoryLot>,
    sku: &str,
    qty: i64,
) -> Result<i64, ProjectionError> {
    let mut lot_keys: Vec<LotKey> = inventory
        .iter()
        .filter(|(_, lot)| lot.sku == sku && lot.qty_on_hand > 0)
        .map(|(k, _)| k.clone())
        .collect();
    lot_keys.sort_by(|a, b| {
        let lot_a = &inventory[a];
        let lot_b = &inventory[b];
        lot_a
            .expiry_date
            .cmp(&lot_b.expiry_date)
            .then_with(|| lot_a.batch_id.cmp(&lot_b.batch_id))
    });

    let available: i64 = lot_keys.iter().map(|k| inventory[k].qty_on_hand).sum();
    if available < qty {
        return Err(ProjectionError::NegativeInventory {
            sku: sku.to_string(),
            qty,
        });
    }

    let mut remaining = qty;
    let mut cost = 0i64;
    for key in lot_keys {
        if remaining == 0 {
            break;
        }
        let lot = inventory.get_mut(&key).unwrap();
        let taken = remaining.min(lot.qty_on_hand);
        lot.qty_on_hand -= taken;
        cost += taken * lot.unit_cost;
        remaining -= taken;
    }
    Ok(cost)
}

fn apply_inventory_event(
    inventory: &mut BTreeMap<LotKey, InventoryLot>,
    shipment_costs: &mut BTreeMap<Uuid, i64>,
    row: &EventRow,
) -> Result<(), ProjectionError> {
    match &row.payload {
        EventPayload::GoodsReceived {
            batch_id,
            items,
            qc_passed,
            ..
        } => {
            if !*qc_passed {
                return Ok(());
            }
            for item in items {
                let key = (item.sku.clone(), batch_id.clone());
                inventory
                    .entry(key)
                    .and_modify(|lot| {
                        let new_qty = lot.qty_on_hand + item.qty;
                        lot.unit_cost = (lot.qty_on_hand * lot.unit_cost + item.qty * item.unit_cost)
                            / new_qty;
                        lot.qty_on_hand = new_qty;
                        lot.expiry_date = item.expiry_date.clone();
                    })
                    .or_insert_with(|| InventoryLot {
                        sku: item.sku.clone(),
                        batch_id: batch_id.clone(),
                        qty_on_hand: item.qty,
                        expiry_date: item.expiry_date.clone(),
                        unit_cost: item.unit_cost,
                    });
            }
            Ok(())
        }
        EventPayload::ShipmentDispatched { items, .. } => {
            let mut total_cost = 0i64;
            for item in items {
                total_cost += consume_fifo(inventory, &item.sku, item.qty)?;
            }
            shipment_costs.insert(row.event_id, total_cost);
            Ok(())
        }
        EventPayload::InventoryAdjusted {
            sku,
            batch_id,
            qty_delta,
            unit_cost,
            ..
        } => {
            let key = (sku.clone(), batch_id.clone());
            if *qty_delta > 0 {
                inventory
                    .entry(key)
                    .and_modify(|lot| {
                        if let Some(adj_cost) = unit_cost {
                            let new_qty = lot.qty_on_hand + qty_delta;
                            lot.unit_cost =
                                (lot.qty_on_hand * lot.unit_cost + qty_delta * adj_cost) / new_qty;
                            lot.qty_on_hand = new_qty;
                        } else {
                            lot.qty_on_hand += qty_delta;
                        }
                    })
                    .or_insert_with(|| InventoryLot {
                        sku: sku.clone(),
                        batch_id: batch_id.clone(),
                        qty_on_hand: *qty_delta,
                        expiry_date: String::new(),
                        unit_cost: unit_cost.unwrap_or(0),
                    });
                Ok(())
            } else {
                let decrement = -qty_delta;
                let lot = inventory.get_mut(&key);
                match lot {
                    Some(lot) if lot.qty_on_hand >= decrement => {
                        lot.qty_on_hand -= decrement;
                        Ok(())
                    }
                    _ => Err(ProjectionError::NegativeInventory {
                        sku: sku.clone(),
                        qty: decrement,
                    }),
                }
            }
        }
        _ => Ok(()),
    }
}

/// Full rebuild from empty. Incremental replay is an optimization callers
/// may add on top; it must yield byte-identical state to a full rebuild.
pub fn rebuild(events: &[EventRow]) -> Result<ProjectionState, ProjectionError> {
    let mut state = ProjectionState::default();
    for row in events {
        apply_order_event(&mut state.orders, row);
        apply_inventory_event(&mut state.inventory, &mut state.shipment_costs, row)?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ledger_events::{
        Actor, ActorType, GoodsReceivedItem, OrderItem, ProcurementItem, ShipmentItem,
    };
    use uuid::Uuid;

    fn row(event_type: &str, payload: EventPayload) -> EventRow {
        EventRow {
            seq_id: 1,
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
            actor: Actor {
                actor_type: ActorType::Agent,
                id: "agent-test".to_string(),
            },
            policy_id: "default".to_string(),
            payload,
            tool_trace: serde_json::json!({}),
            prev_hash: ledger_codec_zero_hash(),
            event_hash: "deadbeef".to_string(),
            signature: vec![],
        }
    }

    fn ledger_codec_zero_hash() -> String {
        "0".repeat(64)
    }

    #[test]
    fn chain_scenario_matches_expected_inventory_and_cogs() {
        let mut rows = vec![
            row(
                "ProcurementOrdered",
                EventPayload::ProcurementOrdered {
                    procurement_id: "P1".to_string(),
                    supplier_id: "S1".to_string(),
                    items: vec![ProcurementItem {
                        sku: "tomato".to_string(),
                        qty: 100,
                        unit_cost: 200,
                    }],
                    expected_date: "2026-01-11".to_string(),
                },
            ),
            row(
                "GoodsReceived",
                EventPayload::GoodsReceived {
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
            ),
            row(
                "OrderPlaced",
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
                "PaymentCaptured",
                EventPayload::PaymentCaptured {
                    order_id: "O1".to_string(),
                    amount: 5000,
                    method: "card".to_string(),
                    receipt_object_key: "r1".to_string(),
                    receipt_hash: "h1".to_string(),
                },
            ),
            row(
                "ShipmentDispatched",
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
        for (i, r) in rows.iter_mut().enumerate() {
            r.seq_id = i as u64 + 1;
        }
        let shipment_event_id = rows[4].event_id;

        let state = rebuild(&rows).unwrap();
        let lot = &state.inventory[&("tomato".to_string(), "B1".to_string())];
        assert_eq!(lot.qty_on_hand, 90);
        assert_eq!(state.shipment_costs[&shipment_event_id], 2000);

        let order = &state.orders["O1"];
        assert_eq!(order.paid_minor_units, 5000);
        assert_eq!(order.revenue(), 5000);
    }

    #[test]
    fn shipment_short_by_one_fails_and_leaves_state_unchanged() {
        let rows = vec![
            row(
                "GoodsReceived",
                EventPayload::GoodsReceived {
                    procurement_id: "P1".to_string(),
                    batch_id: "B1".to_string(),
                    items: vec![GoodsReceivedItem {
                        sku: "tomato".to_string(),
                        qty: 5,
                        expiry_date: "2026-01-20".to_string(),
                        unit_cost: 200,
                    }],
                    qc_passed: true,
                },
            ),
            row(
                "ShipmentDispatched",
                EventPayload::ShipmentDispatched {
                    order_id: "O1".to_string(),
                    items: vec![ShipmentItem {
                        sku: "tomato".to_string(),
                        qty: 6,
                    }],
                    carrier_ref: "CARRIER".to_string(),
                },
            ),
        ];
        let result = rebuild(&rows);
        assert!(matches!(result, Err(ProjectionError::NegativeInventory { .. })));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let rows = vec![row(
            "GoodsReceived",
            EventPayload::GoodsReceived {
                procurement_id: "P1".to_string(),
                batch_id: "B1".to_string(),
                items: vec![GoodsReceivedItem {
                    sku: "tomato".to_string(),
                    qty: 5,
                    expiry_date: "2026-01-20".to_string(),
                    unit_cost: 200,
                }],
                qc_passed: true,
            },
        )];
        let a = rebuild(&rows).unwrap();
        let b = rebuild(&rows).unwrap();
        assert_eq!(
            serde_json::to_string(&a.inventory).unwrap(),
            serde_json::to_string(&b.inventory).unwrap()
        );
    }
}
