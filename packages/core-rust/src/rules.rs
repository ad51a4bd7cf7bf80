//! Alarm rule configuration and alarm payload types.
//!
//! The rule tree is an OR of AND-lists of conditions. Each condition compares
//! a dotted UVE path (`operand1`) against either another UVE path or a JSON
//! literal (`operand2`). Evaluation produces [`AlarmAndList`]s holding the
//! matched conditions together with the concrete values that matched; those
//! land verbatim in the published [`UveAlarmInfo`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Comparison operation of an alarm condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmOperation {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "range")]
    Range,
    #[serde(rename = "size==")]
    SizeEqual,
    #[serde(rename = "size!=")]
    SizeNotEqual,
}

impl AlarmOperation {
    /// Ordered comparisons get a relaxed re-evaluation equality check: their
    /// matched values may drift while the alarm stays logically the same.
    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual | Self::Range
        )
    }
}

impl fmt::Display for AlarmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Range => "range",
            Self::SizeEqual => "size==",
            Self::SizeNotEqual => "size!=",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Rule tree (configuration side)
// ---------------------------------------------------------------------------

/// Right-hand operand: either another UVE path or a JSON literal.
///
/// Exactly one of the fields is expected to be set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlarmOperand2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uve_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_value: Option<String>,
}

impl AlarmOperand2 {
    #[must_use]
    pub fn attribute(path: impl Into<String>) -> Self {
        Self {
            uve_attribute: Some(path.into()),
            json_value: None,
        }
    }

    #[must_use]
    pub fn literal(json: impl Into<String>) -> Self {
        Self {
            uve_attribute: None,
            json_value: Some(json.into()),
        }
    }
}

/// A single comparison within an AND-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmCondition {
    pub operation: AlarmOperation,
    pub operand1: String,
    pub operand2: AlarmOperand2,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Conjunction of conditions; all must hold.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AndList {
    pub and_list: Vec<AlarmCondition>,
}

/// Disjunction of AND-lists; the rule fires when any AND-list holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlarmRules {
    pub or_list: Vec<AndList>,
}

/// One configured alarm rule with its soak and frequency parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Fully qualified alarm name, e.g. `default-global-system-config:vn-down`.
    pub name: String,
    /// Tables or full UVE keys this rule applies to.
    pub uve_keys: Vec<String>,
    pub severity: u8,
    #[serde(default)]
    pub description: String,
    pub alarm_rules: AlarmRules,
    /// Seconds an assertion must hold before the alarm turns Active. Zero
    /// promotes immediately.
    #[serde(default)]
    pub active_timer: u32,
    /// Seconds a clear must hold before an Active alarm returns to Idle.
    #[serde(default)]
    pub idle_timer: u32,
    /// Number of prior assertions inspected by the frequency window.
    #[serde(default)]
    pub freq_check_times: u32,
    /// Width of the frequency window in seconds; also the retention period
    /// of an Idle alarm record.
    #[serde(default)]
    pub freq_check_seconds: u32,
    /// Whether a flapping alarm bypasses the active soak.
    #[serde(default)]
    pub freq_exceeded_check: bool,
    /// Optional scoping: `"project"` restricts the rule to entities whose
    /// parent fq-name matches [`AlarmConfig::parent_fq_name_str`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub parent_fq_name: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlarmConfig {
    #[must_use]
    pub fn parent_fq_name_str(&self) -> String {
        self.parent_fq_name.join(":")
    }
}

// ---------------------------------------------------------------------------
// Matched rule tree (evaluation output)
// ---------------------------------------------------------------------------

/// Concrete values that satisfied one condition instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmMatch {
    /// JSON text of the resolved left operand.
    pub json_operand1_value: String,
    /// JSON text of the resolved right operand; absent when the condition
    /// compared against a JSON literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_operand2_value: Option<String>,
    /// Requested context variables, resolved along the matching path.
    #[serde(default)]
    pub json_variables: BTreeMap<String, String>,
}

/// A condition together with every match it produced (path fan-out can yield
/// several).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConditionMatch {
    pub condition: AlarmCondition,
    #[serde(rename = "match")]
    pub match_list: Vec<AlarmMatch>,
}

/// A satisfied AND-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmAndList {
    pub and_list: Vec<AlarmConditionMatch>,
}

// ---------------------------------------------------------------------------
// Published alarm payloads
// ---------------------------------------------------------------------------

/// One alarm instance as published on a UVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UveAlarmInfo {
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub severity: u8,
    /// Microseconds since the epoch, stamped when the alarm was last raised
    /// or re-raised.
    pub timestamp: i64,
    /// Opaque acknowledgement token handed to clients.
    pub token: String,
    /// The satisfied OR-list; `None` when rule evaluation itself failed.
    pub rules: Option<Vec<AlarmAndList>>,
    pub description: String,
    pub ack: bool,
}

/// The `UVEAlarms` struct attached to a UVE key: either the live alarm list
/// or a deletion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UveAlarms {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarms: Option<Vec<UveAlarmInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_condition() -> AlarmCondition {
        AlarmCondition {
            operation: AlarmOperation::Equal,
            operand1: "UveX.s".to_string(),
            operand2: AlarmOperand2::literal("\"DOWN\""),
            variables: vec![],
        }
    }

    #[test]
    fn operation_serde_uses_symbolic_names() {
        let json = serde_json::to_string(&AlarmOperation::NotIn).unwrap();
        assert_eq!(json, "\"not in\"");
        let op: AlarmOperation = serde_json::from_str("\"size!=\"").unwrap();
        assert_eq!(op, AlarmOperation::SizeNotEqual);
    }

    #[test]
    fn ordered_classification() {
        assert!(AlarmOperation::Range.is_ordered());
        assert!(AlarmOperation::LessOrEqual.is_ordered());
        assert!(!AlarmOperation::Equal.is_ordered());
        assert!(!AlarmOperation::In.is_ordered());
    }

    #[test]
    fn config_round_trip_with_defaults() {
        let doc = serde_json::json!({
            "name": "vn-down",
            "uve_keys": ["virtual-network"],
            "severity": 1,
            "alarm_rules": {"or_list": [
                {"and_list": [{"operation": "==", "operand1": "UveX.s",
                               "operand2": {"json_value": "\"DOWN\""}}]}
            ]}
        });
        let cfg: AlarmConfig = serde_json::from_value(doc).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.active_timer, 0);
        assert_eq!(cfg.alarm_rules.or_list.len(), 1);
        assert_eq!(
            cfg.alarm_rules.or_list[0].and_list[0].operand2.json_value.as_deref(),
            Some("\"DOWN\"")
        );
    }

    #[test]
    fn parent_fq_name_joins_with_colon() {
        let mut cfg: AlarmConfig = serde_json::from_value(serde_json::json!({
            "name": "a", "uve_keys": [], "severity": 0,
            "alarm_rules": {"or_list": []}
        }))
        .unwrap();
        cfg.parent_fq_name = vec!["default-domain".to_string(), "admin".to_string()];
        assert_eq!(cfg.parent_fq_name_str(), "default-domain:admin");
    }

    #[test]
    fn condition_match_serializes_match_field() {
        let acm = AlarmConditionMatch {
            condition: sample_condition(),
            match_list: vec![AlarmMatch {
                json_operand1_value: "\"DOWN\"".to_string(),
                json_operand2_value: None,
                json_variables: BTreeMap::new(),
            }],
        };
        let v = serde_json::to_value(&acm).unwrap();
        assert!(v.get("match").is_some());
        assert!(v.get("match_list").is_none());
    }

    #[test]
    fn uve_alarms_deletion_marker() {
        let del = UveAlarms {
            name: "k1".to_string(),
            alarms: None,
            deleted: Some(true),
        };
        let v = serde_json::to_value(&del).unwrap();
        assert_eq!(v, serde_json::json!({"name": "k1", "deleted": true}));
    }
}
