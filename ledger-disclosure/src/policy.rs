//! Named disclosure policies: what a published statement may contain.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Public,
    Investor,
    Partner,
    Auditor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGranularity {
    Hour,
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofLevel {
    RootOnly,
    RootPlusProof,
    SelectiveDisclosureReady,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Redaction {
    pub hide_customer_ref: bool,
    pub hide_supplier_id: bool,
    pub hide_unit_cost: bool,
    pub allow_sku: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisclosurePolicy {
    pub policy_id: String,
    pub version: String,
    pub audience: Audience,
    pub time_granularity: TimeGranularity,
    pub allowed_metrics: Vec<String>,
    pub allowed_group_by: Vec<String>,
    pub redaction: Redaction,
    pub delay_days: i64,
    pub proof_level: ProofLevel,
}

impl DisclosurePolicy {
    pub fn policy_hash(&self) -> String {
        ledger_codec::hash_canonical(self).expect("policy serializes to supported JSON")
    }

    pub fn allows_metric(&self, key: &str) -> bool {
        self.allowed_metrics.iter().any(|m| m == key)
    }

    pub fn allows_group_by(&self, dim: &str) -> bool {
        self.allowed_group_by.iter().any(|d| d == dim)
    }
}

const PUBLIC_METRICS: &[&str] = &[
    "revenue_cents",
    "refunds_cents",
    "net_revenue_cents",
    "orders_count",
    "shipment_qty",
    "refund_rate_bps",
    "conflict_count",
    "conflict_rate_bps",
    "gross_profit_cents",
    "gross_margin_bps",
    "avg_order_value_cents",
    "repeat_purchase_rate_bps",
];

const ALL_SCALAR_METRICS: &[&str] = &[
    "revenue_cents",
    "refunds_cents",
    "compensation_cents",
    "net_revenue_cents",
    "orders_count",
    "shipment_qty",
    "refund_rate_bps",
    "conflict_count",
    "conflict_rate_bps",
    "gross_profit_cents",
    "gross_margin_bps",
    "avg_order_value_cents",
    "repeat_purchase_rate_bps",
    "inventory_turnover_days",
    "slow_moving_sku_ratio_bps",
    "complaint_resolution_hours_avg",
    "operating_cash_net_inflow_cents",
    "supplier_term_le7_bps",
    "supplier_term_8to14_bps",
    "supplier_term_gt14_bps",
    "supplier_avg_term_days",
    "inventory_waste_qty",
    "inventory_waste_value_cents",
    "supplier_settlement_cents",
];

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn policy_public_v1() -> DisclosurePolicy {
    DisclosurePolicy {
        policy_id: "policy_public_v1".to_string(),
        version: "v1".to_string(),
        audience: Audience::Public,
        time_granularity: TimeGranularity::Day,
        allowed_metrics: strs(PUBLIC_METRICS),
        allowed_group_by: strs(&["channel", "region"]),
        redaction: Redaction {
            hide_customer_ref: true,
            hide_supplier_id: true,
            hide_unit_cost: true,
            allow_sku: false,
        },
        delay_days: 1,
        proof_level: ProofLevel::RootPlusProof,
    }
}

pub fn policy_public_root_only_v1() -> DisclosurePolicy {
    DisclosurePolicy {
        policy_id: "policy_public_root_only_v1".to_string(),
        proof_level: ProofLevel::RootOnly,
        ..policy_public_v1()
    }
}

pub fn policy_investor_v1() -> DisclosurePolicy {
    DisclosurePolicy {
        policy_id: "policy_investor_v1".to_string(),
        version: "v1".to_string(),
        audience: Audience::Investor,
        time_granularity: TimeGranularity::Month,
        allowed_metrics: strs(ALL_SCALAR_METRICS),
        allowed_group_by: strs(&["channel", "region", "sku"]),
        redaction: Redaction {
            hide_customer_ref: true,
            hide_supplier_id: false,
            hide_unit_cost: false,
            allow_sku: true,
        },
        delay_days: 7,
        proof_level: ProofLevel::RootPlusProof,
    }
}

pub fn policy_auditor_v1() -> DisclosurePolicy {
    DisclosurePolicy {
        policy_id: "policy_auditor_v1".to_string(),
        version: "v1".to_string(),
        audience: Audience::Auditor,
        time_granularity: TimeGranularity::Day,
        allowed_metrics: strs(ALL_SCALAR_METRICS),
        allowed_group_by: strs(&["channel", "region", "sku", "payment_term_bucket"]),
        redaction: Redaction {
            hide_customer_ref: false,
            hide_supplier_id: false,
            hide_unit_cost: false,
            allow_sku: true,
        },
        delay_days: 0,
        proof_level: ProofLevel::SelectiveDisclosureReady,
    }
}

/// Looks up one of the four bundled policies by id. Callers needing a custom
/// policy construct a `DisclosurePolicy` directly; this catalog only ships
/// the starter set.
pub fn get_policy(policy_id: &str) -> Option<DisclosurePolicy> {
    match policy_id {
        "policy_public_v1" => Some(policy_public_v1()),
        "policy_public_root_only_v1" => Some(policy_public_root_only_v1()),
        "policy_investor_v1" => Some(policy_investor_v1()),
        "policy_auditor_v1" => Some(policy_auditor_v1()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_policy_excludes_supplier_only_metrics() {
        let p = policy_public_v1();
        assert!(!p.allows_metric("supplier_avg_term_days"));
        assert!(p.allows_metric("revenue_cents"));
        assert!(!p.allows_group_by("sku"));
    }

    #[test]
    fn auditor_policy_allows_every_dimension() {
        let p = policy_auditor_v1();
        assert!(p.allows_group_by("payment_term_bucket"));
        assert_eq!(p.proof_level, ProofLevel::SelectiveDisclosureReady);
    }

    #[test]
    fn policy_hash_is_stable() {
        let a = policy_public_v1();
        let b = policy_public_v1();
        assert_eq!(a.policy_hash(), b.policy_hash());
    }
}
