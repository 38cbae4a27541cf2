//! The closed event-kind enum and the ledger event row.
//!
//! The heterogeneous payload is a tagged Rust enum (`#[serde(tag =
//! "event_type")]`), not a dynamic map — validation happens once, per
//! variant, at construction. Unknown tags fail to deserialize, which is the
//! schema-rejection behavior the append path requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("schema validation failed for {event_type}: {reason}")]
    SchemaValidation {
        event_type: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Agent,
    Human,
    System,
    Auditor,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::Agent => "agent",
            ActorType::Human => "human",
            ActorType::System => "system",
            ActorType::Auditor => "auditor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcurementItem {
    pub sku: String,
    pub qty: i64,
    pub unit_cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodsReceivedItem {
    pub sku: String,
    pub qty: i64,
    pub expiry_date: String,
    pub unit_cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub qty: i64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentItem {
    pub sku: String,
    pub qty: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    ProcurementOrdered {
        procurement_id: String,
        supplier_id: String,
        items: Vec<ProcurementItem>,
        expected_date: String,
    },
    GoodsReceived {
        procurement_id: String,
        batch_id: String,
        items: Vec<GoodsReceivedItem>,
        qc_passed: bool,
    },
    OrderPlaced {
        order_id: String,
        customer_ref: String,
        items: Vec<OrderItem>,
        channel: String,
        region: String,
    },
    PaymentCaptured {
        order_id: String,
        amount: i64,
        method: String,
        receipt_object_key: String,
        receipt_hash: String,
    },
    ShipmentDispatched {
        order_id: String,
        items: Vec<ShipmentItem>,
        carrier_ref: String,
    },
    RefundIssued {
        order_id: String,
        amount: i64,
        reason: String,
    },
    InventoryAdjusted {
        sku: String,
        batch_id: String,
        qty_delta: i64,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit_cost: Option<i64>,
    },
    DisclosurePublished {
        disclosure_id: Uuid,
        policy_id: String,
        period_start: String,
        period_end: String,
        metrics: serde_json::Value,
        merkle_root: String,
        anchor_ref: String,
        statement_sig_hash: String,
    },
    SelectiveDisclosureRevealed {
        disclosure_id: Uuid,
        token_id: Uuid,
        subject: String,
        metric_key: String,
        group: serde_json::Value,
        revealed_event_hashes: Vec<String>,
    },
    ToolInvocationLogged {
        tool_name: String,
        actor_id: String,
        permissions: Vec<String>,
        outcome: String,
        duration_ms: i64,
    },
    OrchestratorStateChanged {
        run_id: String,
        from_state: String,
        to_state: String,
        reason: String,
    },
    DemoScenarioInitialized {
        scenario_id: String,
        seeded_event_count: i64,
    },
    SupplierContractSigned {
        supplier_id: String,
        contract_ref: String,
        payment_term_days: i64,
    },
    PolicyUpdated {
        policy_kind: String,
        policy_id: String,
        policy_hash: String,
    },
    ComplaintLogged {
        order_id: String,
        complaint_id: String,
        category: String,
        #[serde(with = "ledger_codec::rfc3339")]
        opened_at: DateTime<Utc>,
    },
    CustomerConflictReported {
        order_id: String,
        conflict_id: String,
        category: String,
    },
    CompanyCompensationIssued {
        order_id: String,
        amount: i64,
        reason: String,
    },
    SkillRunStarted {
        run_id: String,
        skill_name: String,
        input_digest: String,
    },
    SkillRunFinished {
        run_id: String,
        skill_name: String,
        output_digest: String,
        duration_ms: i64,
    },
    SkillRunFailed {
        run_id: String,
        skill_name: String,
        error_kind: String,
        message: String,
    },
}

impl EventPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventPayload::ProcurementOrdered { .. } => "ProcurementOrdered",
            EventPayload::GoodsReceived { .. } => "GoodsReceived",
            EventPayload::OrderPlaced { .. } => "OrderPlaced",
            EventPayload::PaymentCaptured { .. } => "PaymentCaptured",
            EventPayload::ShipmentDispatched { .. } => "ShipmentDispatched",
            EventPayload::RefundIssued { .. } => "RefundIssued",
            EventPayload::InventoryAdjusted { .. } => "InventoryAdjusted",
            EventPayload::DisclosurePublished { .. } => "DisclosurePublished",
            EventPayload::SelectiveDisclosureRevealed { .. } => "SelectiveDisclosureRevealed",
            EventPayload::ToolInvocationLogged { .. } => "ToolInvocationLogged",
            EventPayload::OrchestratorStateChanged { .. } => "OrchestratorStateChanged",
            EventPayload::DemoScenarioInitialized { .. } => "DemoScenarioInitialized",
            EventPayload::SupplierContractSigned { .. } => "SupplierContractSigned",
            EventPayload::PolicyUpdated { .. } => "PolicyUpdated",
            EventPayload::ComplaintLogged { .. } => "ComplaintLogged",
            EventPayload::CustomerConflictReported { .. } => "CustomerConflictReported",
            EventPayload::CompanyCompensationIssued { .. } => "CompanyCompensationIssued",
            EventPayload::SkillRunStarted { .. } => "SkillRunStarted",
            EventPayload::SkillRunFinished { .. } => "SkillRunFinished",
            EventPayload::SkillRunFailed { .. } => "SkillRunFailed",
        }
    }

    /// Per-variant shape checks beyond what serde's typing already enforces.
    pub fn validate(&self) -> Result<(), EventError> {
        let kind = self.kind_name();
        let fail = |reason: &str| {
            Err(EventError::SchemaValidation {
                event_type: kind,
                reason: reason.to_string(),
            })
        };
        match self {
            EventPayload::ProcurementOrdered { items, .. } => {
                if items.is_empty() {
                    return fail("items must not be empty");
                }
                if items.iter().any(|i| i.qty <= 0 || i.unit_cost < 0) {
                    return fail("qty must be positive and unit_cost non-negative");
                }
                Ok(())
            }
            EventPayload::GoodsReceived { items, .. } => {
                if items.is_empty() {
                    return fail("items must not be empty");
                }
                if items.iter().any(|i| i.qty <= 0 || i.unit_cost < 0) {
                    return fail("qty must be positive and unit_cost non-negative");
                }
                Ok(())
            }
            EventPayload::OrderPlaced { items, .. } => {
                if items.is_empty() {
                    return fail("items must not be empty");
                }
                if items.iter().any(|i| i.qty <= 0 || i.unit_price < 0) {
                    return fail("qty must be positive and unit_price non-negative");
                }
                Ok(())
            }
            EventPayload::PaymentCaptured { amount, .. } => {
                if *amount <= 0 {
                    return fail("amount must be positive");
                }
                Ok(())
            }
            EventPayload::ShipmentDispatched { items, .. } => {
                if items.is_empty() {
                    return fail("items must not be empty");
                }
                if items.iter().any(|i| i.qty <= 0) {
                    return fail("qty must be positive");
                }
                Ok(())
            }
            EventPayload::RefundIssued { amount, .. } => {
                if *amount <= 0 {
                    return fail("amount must be positive");
                }
                Ok(())
            }
            EventPayload::InventoryAdjusted {
                qty_delta,
                unit_cost,
                ..
            } => {
                if *qty_delta == 0 {
                    return fail("qty_delta must be non-zero");
                }
                if *qty_delta < 0 && unit_cost.is_some() {
                    return fail("unit_cost is only meaningful for positive qty_delta");
                }
                Ok(())
            }
            EventPayload::CompanyCompensationIssued { amount, .. } => {
                if *amount <= 0 {
                    return fail("amount must be positive");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Constructor input: the caller supplies everything except the fields the
/// ledger store assigns at append time (`seq_id`, `prev_hash`, `event_hash`,
/// `signature`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreateRequest {
    /// Caller-supplied idempotency key; when omitted the store mints one.
    /// Appending a request whose `event_id` already exists in the log is
    /// rejected rather than silently deduplicated.
    #[serde(default)]
    pub event_id: Option<Uuid>,
    pub actor: Actor,
    pub policy_id: String,
    pub payload: EventPayload,
    #[serde(with = "ledger_codec::rfc3339")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default = "serde_json::Value::default")]
    pub tool_trace: serde_json::Value,
}

/// The persisted, hash-chained, signed event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub seq_id: u64,
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(with = "ledger_codec::rfc3339")]
    pub occurred_at: DateTime<Utc>,
    pub actor: Actor,
    pub policy_id: String,
    pub payload: EventPayload,
    pub tool_trace: serde_json::Value,
    pub prev_hash: String,
    pub event_hash: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl EventRow {
    /// The view that gets signed and hashed: every field except `signature`.
    pub fn signed_view(&self) -> serde_json::Value {
        serde_json::json!({
            "event_id": self.event_id,
            "event_type": self.event_type,
            "occurred_at": ledger_codec::format_instant(&self.occurred_at),
            "actor": self.actor,
            "policy_id": self.policy_id,
            "payload": self.payload,
            "tool_trace": self.tool_trace,
            "prev_hash": self.prev_hash,
        })
    }

    /// The view the `event_hash` commits to: the signed view plus the
    /// signature itself.
    pub fn hashed_view(&self) -> serde_json::Value {
        let mut view = self.signed_view();
        view["signature"] = serde_json::Value::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &self.signature,
        ));
        view
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}
