#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

//! Engine behaviour driven through configuration files

use std::collections::HashMap;

use chrono::NaiveDateTime;
use twc_policy::{
    PolicyAction, PolicyConfig, PolicyContext, PolicyEngine, PolicyFunction, Value,
};

struct Home {
    now: f64,
    hour: u32,
    settings: HashMap<String, Value>,
    green_amps: f64,
}

impl Home {
    fn at(now: f64, hour: u32) -> Self {
        Self {
            now,
            hour,
            settings: HashMap::new(),
            green_amps: 0.0,
        }
    }

    fn with(mut self, key: &str, value: f64) -> Self {
        self.settings.insert(key.into(), Value::Number(value));
        self
    }
}

impl PolicyContext for Home {
    fn now(&self) -> f64 {
        self.now
    }

    fn local_time(&self) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(
            &format!("2024-06-05 {:02}:00:00", self.hour),
            "%Y-%m-%d %H:%M:%S",
        )
        .unwrap()
    }

    fn setting(&self, name: &str) -> Option<Value> {
        self.settings.get(name).cloned()
    }

    fn config(&self, _name: &str) -> Option<Value> {
        None
    }

    fn call(&self, function: PolicyFunction) -> Value {
        match function {
            PolicyFunction::CheckScheduledCharging => Value::Number(0.0),
            PolicyFunction::GreenEnergyAmps => Value::Number(self.green_amps),
        }
    }
}

const LATCH_CONFIG: &str = r#"
override:
  - name: Solar Latch
    match: [settings.surplus]
    condition: [gt]
    value: [0]
    charge_amps: getMaxAmpsToDivideGreenEnergy()
    latch_period: 5
  - name: Idle
    match: [none]
    condition: [none]
    value: [0]
    charge_amps: 0
engine:
  policyCheckInterval: 10
"#;

#[test]
fn latched_rule_holds_for_its_period() {
    let config: PolicyConfig = serde_yaml::from_str(LATCH_CONFIG).unwrap();
    let mut engine = PolicyEngine::from_config(&config, None).unwrap();

    let mut home = Home::at(1_000.0, 12).with("surplus", 1.0);
    home.green_amps = 18.0;
    let actions = engine.evaluate(&home);
    assert_eq!(engine.active_policy(), Some("Solar Latch"));
    assert!(actions.contains(&PolicyAction::SetMaxAmps(18.0)));

    // conditions stop matching but the latch keeps the rule for five minutes
    for t in [1_060.0, 1_200.0, 1_299.0] {
        engine.evaluate(&Home::at(t, 12));
        assert_eq!(engine.active_policy(), Some("Solar Latch"), "at t={}", t);
    }

    engine.evaluate(&Home::at(1_300.0, 12));
    assert_eq!(engine.active_policy(), Some("Idle"));
}

#[test]
fn latch_is_not_refreshed_while_only_latched() {
    let config: PolicyConfig = serde_yaml::from_str(LATCH_CONFIG).unwrap();
    let mut engine = PolicyEngine::from_config(&config, None).unwrap();

    engine.evaluate(&Home::at(0.0, 12).with("surplus", 1.0));
    engine.evaluate(&Home::at(200.0, 12));
    engine.evaluate(&Home::at(299.0, 12));
    assert_eq!(engine.active_policy(), Some("Solar Latch"));
    engine.evaluate(&Home::at(310.0, 12));
    assert_eq!(engine.active_policy(), Some("Idle"));
}

#[test]
fn green_energy_latch_applies_to_daytime_rule() {
    let mut engine = PolicyEngine::from_config(&PolicyConfig::default(), Some(2.0)).unwrap();

    engine.evaluate(&Home::at(0.0, 19));
    assert_eq!(engine.active_policy(), Some("Track Green Energy"));
    assert!(engine.is_green());

    // 20:00 is past the window; the latch holds for two minutes
    engine.evaluate(&Home::at(60.0, 20).with("nonScheduledAmpsMax", 16.0));
    assert_eq!(engine.active_policy(), Some("Track Green Energy"));

    let actions = engine.evaluate(&Home::at(120.0, 20).with("nonScheduledAmpsMax", 16.0));
    assert_eq!(engine.active_policy(), Some("Non Scheduled Charging"));
    assert!(actions.contains(&PolicyAction::SetMaxAmps(16.0)));
}

#[test]
fn green_rule_queues_background_task() {
    let mut engine = PolicyEngine::from_config(&PolicyConfig::default(), None).unwrap();
    let actions = engine.evaluate(&Home::at(0.0, 10));
    assert!(actions.contains(&PolicyAction::QueueTask("checkGreenEnergy".into())));
    assert!(!actions.iter().any(|a| matches!(a, PolicyAction::SetMaxAmps(_))));
    assert_eq!(actions.last(), Some(&PolicyAction::ApplyChargeLimit(-1)));
}

#[test]
fn non_scheduled_green_fallback() {
    let mut engine = PolicyEngine::from_config(&PolicyConfig::default(), None).unwrap();
    engine.evaluate(&Home::at(0.0, 23).with("nonScheduledAction", 3.0));
    assert_eq!(engine.active_policy(), Some("Track Green Energy"));
    assert!(engine.is_green());
}

#[test]
fn hour_resume_delays_green_tracking() {
    let mut engine = PolicyEngine::from_config(&PolicyConfig::default(), None).unwrap();
    engine.evaluate(
        &Home::at(0.0, 9)
            .with("hourResumeTrackGreenEnergy", 11.0)
            .with("nonScheduledAmpsMax", 8.0),
    );
    assert_eq!(engine.active_policy(), Some("Non Scheduled Charging"));
}

#[test]
fn extensions_parse_from_yaml() {
    let config: PolicyConfig = serde_yaml::from_str(
        r#"
extend:
  emergency:
    - name: Grid Outage
      match: [settings.gridDown]
      condition: [eq]
      value: [1]
      charge_amps: 0
  webhooks:
    Charge Now:
      enter: http://localhost/enter
  restrictions:
    Scheduled Charging:
      match: [tm_wday]
      condition: [lt]
      value: [5]
"#,
    )
    .unwrap();
    let engine = PolicyEngine::from_config(&config, None).unwrap();
    let names: Vec<_> = engine.rules().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names[0], "Grid Outage");
    assert_eq!(names.len(), 6);
    assert_eq!(engine.rules()[1].webhooks.enter.as_deref(), Some("http://localhost/enter"));
    assert_eq!(engine.rules()[2].checks.len(), 2);
}
