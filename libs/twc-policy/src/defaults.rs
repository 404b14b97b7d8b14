//! Built-in policy list

use serde_json::json;

use crate::types::{PolicyRule, Webhooks};

fn rule(
    name: &str,
    matches: serde_json::Value,
    condition: serde_json::Value,
    value: serde_json::Value,
) -> PolicyRule {
    let list = |v: serde_json::Value| match v {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    PolicyRule {
        name: name.to_string(),
        matches: list(matches),
        condition: list(condition),
        value: list(value),
        charge_amps: None,
        charge_limit: None,
        allowed_flex: None,
        background_task: None,
        latch_period: None,
        webhooks: Webhooks::default(),
    }
}

/// The five default rules, highest priority first
///
/// 1. Charge Now while `chargeNowAmps` is set and `chargeNowTimeEnd` lies ahead
/// 2. Scheduled Charging inside the configured window
/// 3. Track Green Energy between 06:00 and 20:00
/// 4. Non Scheduled Charging unless `nonScheduledAction` is 3
/// 5. Track Green Energy as the non-scheduled fallback
pub fn default_policy() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            charge_amps: Some(json!("settings.chargeNowAmps")),
            charge_limit: Some(json!("config.chargeNowLimit")),
            ..rule(
                "Charge Now",
                json!([
                    "settings.chargeNowAmps",
                    "settings.chargeNowTimeEnd",
                    "settings.chargeNowTimeEnd"
                ]),
                json!(["gt", "gt", "gt"]),
                json!([0, 0, "now"]),
            )
        },
        PolicyRule {
            charge_amps: Some(json!("settings.scheduledAmpsMax")),
            charge_limit: Some(json!("config.scheduledLimit")),
            ..rule(
                "Scheduled Charging",
                json!(["checkScheduledCharging()"]),
                json!(["eq"]),
                json!([1]),
            )
        },
        PolicyRule {
            background_task: Some("checkGreenEnergy".into()),
            allowed_flex: Some(json!("config.greenEnergyFlexAmps")),
            charge_limit: Some(json!("config.greenEnergyLimit")),
            ..rule(
                "Track Green Energy",
                json!(["tm_hour", "tm_hour", "settings.hourResumeTrackGreenEnergy"]),
                json!(["gte", "lt", "lte"]),
                json!([6, 20, "tm_hour"]),
            )
        },
        PolicyRule {
            charge_amps: Some(json!("settings.nonScheduledAmpsMax")),
            charge_limit: Some(json!("config.nonScheduledLimit")),
            ..rule(
                "Non Scheduled Charging",
                json!(["settings.nonScheduledAction"]),
                json!(["lt"]),
                json!([3]),
            )
        },
        PolicyRule {
            background_task: Some("checkGreenEnergy".into()),
            allowed_flex: Some(json!("config.greenEnergyFlexAmps")),
            charge_limit: Some(json!("config.greenEnergyLimit")),
            ..rule(
                "Track Green Energy",
                json!(["settings.nonScheduledAction"]),
                json!(["eq"]),
                json!([3]),
            )
        },
    ]
}
