//! Ordered-rule governance engine gating ledger writes.
//!
//! A policy is an ordered rule list plus one `default_decision` bit for the
//! `event:*` namespace. `tool:*` actions with no matching rule always deny —
//! the reference mixed these two defaults across call sites; this crate
//! exposes the single explicit field the specification requires and keeps
//! the `tool:*` fallback hardcoded to deny (see DESIGN.md, open question a).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("action denied by rule {rule_id}: {reason}")]
    Denied { rule_id: String, reason: String },
    #[error("action denied by default: {0}")]
    DeniedByDefault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub path: String,
    pub op: ConditionOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredSigner {
    Agent,
    Human,
    Auditor,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceRule {
    pub rule_id: String,
    pub action: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub required_actor_types: Vec<String>,
    #[serde(default = "default_required_signer")]
    pub required_signer: RequiredSigner,
    #[serde(default)]
    pub approval_chain: Vec<String>,
}

fn default_required_signer() -> RequiredSigner {
    RequiredSigner::Any
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernancePolicy {
    pub version: String,
    pub default_decision: Decision,
    pub rules: Vec<GovernanceRule>,
}

impl GovernancePolicy {
    pub fn policy_hash(&self) -> String {
        ledger_codec::hash_canonical(self).expect("policy serializes to supported JSON")
    }
}

/// The bundled starter policy: deny-by-default for unmatched `tool:*`
/// actions (fixed, not configurable), allow-by-default for unmatched
/// `event:*` actions, with four concrete rules.
pub fn default_policy() -> GovernancePolicy {
    GovernancePolicy {
        version: "v1".to_string(),
        default_decision: Decision::Allow,
        rules: vec![
            GovernanceRule {
                rule_id: "large_procurement_requires_approval".to_string(),
                action: "event:ProcurementOrdered".to_string(),
                conditions: vec![RuleCondition {
                    path: "derived.total_minor_units".to_string(),
                    op: ConditionOp::Gte,
                    value: Some(Value::from(1_000_000_i64)),
                }],
                required_actor_types: vec![],
                required_signer: RequiredSigner::Any,
                approval_chain: vec!["human".to_string()],
            },
            GovernanceRule {
                rule_id: "refund_requires_human_or_auditor".to_string(),
                action: "event:RefundIssued".to_string(),
                conditions: vec![],
                required_actor_types: vec!["human".to_string(), "auditor".to_string()],
                required_signer: RequiredSigner::Any,
                approval_chain: vec![],
            },
            GovernanceRule {
                rule_id: "compensation_requires_human".to_string(),
                action: "event:CompanyCompensationIssued".to_string(),
                conditions: vec![],
                required_actor_types: vec!["human".to_string()],
                required_signer: RequiredSigner::Any,
                approval_chain: vec![],
            },
            GovernanceRule {
                rule_id: "inventory_adjustment_requires_reason".to_string(),
                action: "event:InventoryAdjusted".to_string(),
                conditions: vec![RuleCondition {
                    path: "payload.reason".to_string(),
                    op: ConditionOp::Exists,
                    value: None,
                }],
                required_actor_types: vec![],
                required_signer: RequiredSigner::Any,
                approval_chain: vec![],
            },
        ],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub allowed: bool,
    pub rule_id: Option<String>,
    pub reason: String,
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare_numbers(op: ConditionOp, actual: &Value, expected: &Value) -> bool {
    let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
        return false;
    };
    match op {
        ConditionOp::Gt => a > b,
        ConditionOp::Gte => a >= b,
        ConditionOp::Lt => a < b,
        ConditionOp::Lte => a <= b,
        _ => unreachable!(),
    }
}

fn condition_holds(context: &Value, condition: &RuleCondition) -> bool {
    let actual = get_path(context, &condition.path);
    match condition.op {
        ConditionOp::Exists => actual.is_some(),
        ConditionOp::Eq => actual == condition.value.as_ref(),
        ConditionOp::Ne => actual != condition.value.as_ref(),
        ConditionOp::Gt | ConditionOp::Gte | ConditionOp::Lt | ConditionOp::Lte => {
            match (actual, &condition.value) {
                (Some(a), Some(b)) => compare_numbers(condition.op, a, b),
                _ => false,
            }
        }
        ConditionOp::In => match (actual, &condition.value) {
            (Some(a), Some(Value::Array(items))) => items.contains(a),
            _ => false,
        },
        ConditionOp::Contains => match actual {
            Some(Value::Array(items)) => condition
                .value
                .as_ref()
                .map(|v| items.contains(v))
                .unwrap_or(false),
            Some(Value::String(s)) => condition
                .value
                .as_ref()
                .and_then(|v| v.as_str())
                .map(|needle| s.contains(needle))
                .unwrap_or(false),
            _ => false,
        },
    }
}

pub struct GovernancePolicyEngine {
    policy: GovernancePolicy,
}

impl GovernancePolicyEngine {
    pub fn new(policy: GovernancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GovernancePolicy {
        &self.policy
    }

    /// Computes the `derived` context bucket. Currently only the one fact
    /// the bundled ruleset needs: the total minor-unit value of a
    /// `ProcurementOrdered` payload's line items.
    fn derive(action: &str, payload: &Value) -> Value {
        if action == "event:ProcurementOrdered" {
            let total: i64 = payload
                .get("items")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .map(|item| {
                            let qty = item.get("qty").and_then(|v| v.as_i64()).unwrap_or(0);
                            let unit_cost =
                                item.get("unit_cost").and_then(|v| v.as_i64()).unwrap_or(0);
                            qty * unit_cost
                        })
                        .sum()
                })
                .unwrap_or(0);
            return serde_json::json!({ "total_minor_units": total });
        }
        Value::Object(Default::default())
    }

    pub fn evaluate(
        &self,
        action: &str,
        actor_type: &str,
        signer_role: &str,
        payload: &Value,
        tool_trace: &Value,
        approvals: &[String],
    ) -> GovernanceDecision {
        let mut effective_approvals: Vec<String> = approvals.to_vec();
        effective_approvals.push(signer_role.to_string());
        effective_approvals.push(actor_type.to_string());

        let derived = Self::derive(action, payload);
        let context = serde_json::json!({
            "action": action,
            "actor_type": actor_type,
            "signer_role": signer_role,
            "payload": payload,
            "tool_trace": tool_trace,
            "approvals": effective_approvals,
            "derived": derived,
        });

        for rule in &self.policy.rules {
            if rule.action != action {
                continue;
            }
            if !rule.conditions.iter().all(|c| condition_holds(&context, c)) {
                continue;
            }

            if !rule.required_actor_types.is_empty()
                && !rule.required_actor_types.iter().any(|t| t == actor_type)
            {
                return GovernanceDecision {
                    allowed: false,
                    rule_id: Some(rule.rule_id.clone()),
                    reason: format!(
                        "rule {} requires actor_type in {:?}, got {}",
                        rule.rule_id, rule.required_actor_types, actor_type
                    ),
                };
            }

            if let RequiredSigner::Agent | RequiredSigner::Human | RequiredSigner::Auditor =
                rule.required_signer
            {
                let expected = match rule.required_signer {
                    RequiredSigner::Agent => "agent",
                    RequiredSigner::Human => "human",
                    RequiredSigner::Auditor => "auditor",
                    RequiredSigner::Any => unreachable!(),
                };
                if signer_role != expected {
                    return GovernanceDecision {
                        allowed: false,
                        rule_id: Some(rule.rule_id.clone()),
                        reason: format!(
                            "rule {} requires signer_role={}, got={}",
                            rule.rule_id, expected, signer_role
                        ),
                    };
                }
            }

            let missing: Vec<&String> = rule
                .approval_chain
                .iter()
                .filter(|needed| !effective_approvals.contains(needed))
                .collect();
            if !missing.is_empty() {
                return GovernanceDecision {
                    allowed: false,
                    rule_id: Some(rule.rule_id.clone()),
                    reason: format!(
                        "rule {} requires approvals {:?}, missing {:?}",
                        rule.rule_id, rule.approval_chain, missing
                    ),
                };
            }

            return GovernanceDecision {
                allowed: true,
                rule_id: Some(rule.rule_id.clone()),
                reason: format!("matched rule {}", rule.rule_id),
            };
        }

        if action.starts_with("tool:") {
            GovernanceDecision {
                allowed: false,
                rule_id: None,
                reason: format!("action {} denied by default (no matching rule)", action),
            }
        } else {
            GovernanceDecision {
                allowed: self.policy.default_decision == Decision::Allow,
                rule_id: None,
                reason: format!(
                    "no matching rule for {}; policy default_decision applied",
                    action
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> GovernancePolicyEngine {
        GovernancePolicyEngine::new(default_policy())
    }

    #[test]
    fn denies_unknown_tool_action_by_default() {
        let decision = engine().evaluate(
            "tool:unknown.connector_action",
            "agent",
            "agent",
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[],
        );
        assert!(!decision.allowed);
        assert!(decision.reason.contains("denied by default"));
    }

    #[test]
    fn allows_unknown_event_action_by_default() {
        let decision = engine().evaluate(
            "event:SkillRunStarted",
            "agent",
            "agent",
            &serde_json::json!({}),
            &serde_json::json!({}),
            &[],
        );
        assert!(decision.allowed);
    }

    #[test]
    fn refund_without_human_or_auditor_actor_is_denied() {
        let decision = engine().evaluate(
            "event:RefundIssued",
            "agent",
            "agent",
            &serde_json::json!({"amount": 500}),
            &serde_json::json!({}),
            &[],
        );
        assert!(!decision.allowed);
        assert_eq!(
            decision.rule_id.as_deref(),
            Some("refund_requires_human_or_auditor")
        );
    }

    #[test]
    fn large_procurement_requires_human_approval() {
        let payload = serde_json::json!({
            "items": [{"sku": "x", "qty": 100, "unit_cost": 20000}]
        });
        let denied = engine().evaluate(
            "event:ProcurementOrdered",
            "agent",
            "agent",
            &payload,
            &serde_json::json!({}),
            &[],
        );
        assert!(!denied.allowed);

        let allowed = engine().evaluate(
            "event:ProcurementOrdered",
            "agent",
            "agent",
            &payload,
            &serde_json::json!({}),
            &["human".to_string()],
        );
        assert!(allowed.allowed);
    }
}
