//! Policy configuration types
//!
//! These mirror the `policy` section of the service configuration. Rule
//! fields keep their historical snake_case names (`charge_amps`,
//! `latch_period`, ...) so existing rule files load unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

// ============================================================================
// Rule definition
// ============================================================================

/// One entry of the ordered policy list, as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    /// Policy name, shown in status output and used by extensions
    pub name: String,

    /// Left-hand operands
    #[serde(rename = "match", default)]
    pub matches: Vec<JsonValue>,

    /// Comparison per operand pair
    #[serde(default)]
    pub condition: Vec<JsonValue>,

    /// Right-hand operands
    #[serde(default)]
    pub value: Vec<JsonValue>,

    /// Budget for all slaves while this policy is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_amps: Option<JsonValue>,

    /// Vehicle state-of-charge limit (50..=100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_limit: Option<JsonValue>,

    /// Headroom below minAmpsPerTWC usable to start a charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_flex: Option<JsonValue>,

    /// Background task queued on every enforcement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_task: Option<String>,

    /// Minutes a match stays in force after conditions stop matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latch_period: Option<f64>,

    #[serde(default, skip_serializing_if = "Webhooks::is_empty")]
    pub webhooks: Webhooks,
}

/// URLs called on policy transitions and charge start/stop
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

impl Webhooks {
    pub fn is_empty(&self) -> bool {
        self.enter.is_none() && self.exit.is_none() && self.start.is_none() && self.stop.is_none()
    }

    pub fn get(&self, hook: Hook) -> Option<&str> {
        match hook {
            Hook::Enter => self.enter.as_deref(),
            Hook::Exit => self.exit.as_deref(),
            Hook::Start => self.start.as_deref(),
            Hook::Stop => self.stop.as_deref(),
        }
    }
}

/// Webhook trigger points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Enter,
    Exit,
    Start,
    Stop,
}

// ============================================================================
// Policy section
// ============================================================================

/// The `policy` configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Replace the default list entirely
    #[serde(rename = "override", default)]
    pub override_rules: Vec<PolicyRule>,

    /// Extend the default list
    #[serde(default)]
    pub extend: PolicyExtend,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Extensions applied to the default list when no override is given
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyExtend {
    /// Inserted before Non Scheduled Charging
    #[serde(default)]
    pub after: Vec<PolicyRule>,

    /// Inserted after Charge Now
    #[serde(default)]
    pub before: Vec<PolicyRule>,

    /// Inserted at the top
    #[serde(default)]
    pub emergency: Vec<PolicyRule>,

    /// Extra conditions appended to a named policy
    #[serde(default)]
    pub restrictions: HashMap<String, Restriction>,

    /// Webhooks attached to a named policy
    #[serde(default)]
    pub webhooks: HashMap<String, Webhooks>,
}

/// Additional match/condition/value triples for an existing policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(rename = "match", default)]
    pub matches: Vec<JsonValue>,
    #[serde(default)]
    pub condition: Vec<JsonValue>,
    #[serde(default)]
    pub value: Vec<JsonValue>,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between evaluations
    #[serde(rename = "policyCheckInterval", default = "default_check_interval")]
    pub policy_check_interval: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy_check_interval: default_check_interval(),
        }
    }
}

fn default_check_interval() -> f64 {
    30.0
}
