//! Policy engine
//!
//! Scans the ordered rule list once per check interval and enforces the
//! first rule that matches (or is latched). Enforcement does not touch any
//! state outside the engine; it returns [`PolicyAction`]s for the caller
//! to apply.

use crate::condition::{check_conditions, Check};
use crate::defaults::default_policy;
use crate::error::{PolicyError, Result};
use crate::types::{Hook, PolicyConfig, PolicyRule, Webhooks};
use crate::value::{PolicyContext, PolicyValue, Value};

/// Index of the green-energy rule in the default list
const GREEN_ENERGY_RULE: usize = 2;

/// Side effects requested by an enforcement
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    /// Call a webhook URL
    Webhook(String),
    /// New budget to divide among slaves
    SetMaxAmps(f64),
    SetAllowedFlex(f64),
    /// Queue the named background task
    QueueTask(String),
    /// Vehicle charge limit, -1 for "restore previous"
    ApplyChargeLimit(i32),
}

/// A rule ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub checks: Vec<Check>,
    pub charge_amps: Option<PolicyValue>,
    pub charge_limit: Option<PolicyValue>,
    pub allowed_flex: Option<PolicyValue>,
    pub background_task: Option<String>,
    pub latch_period: Option<f64>,
    pub webhooks: Webhooks,
}

impl CompiledRule {
    pub fn compile(rule: &PolicyRule) -> Result<Self> {
        Ok(Self {
            name: rule.name.clone(),
            checks: Check::compile(&rule.name, &rule.matches, &rule.condition, &rule.value)?,
            charge_amps: rule.charge_amps.as_ref().map(PolicyValue::parse),
            charge_limit: rule.charge_limit.as_ref().map(PolicyValue::parse),
            allowed_flex: rule.allowed_flex.as_ref().map(PolicyValue::parse),
            background_task: rule.background_task.clone(),
            latch_period: rule.latch_period,
            webhooks: rule.webhooks.clone(),
        })
    }

    /// Green rules derive their budget from solar surplus
    pub fn is_green(&self) -> bool {
        self.background_task.as_deref() == Some("checkGreenEnergy") && self.charge_amps.is_none()
    }
}

/// Build the effective rule list from configuration
///
/// An `override` list replaces the defaults outright. Otherwise the default
/// list gets restrictions, webhooks, the green-energy latch and the
/// emergency/before/after insertions, in that order.
pub fn build_rules(config: &PolicyConfig, green_energy_latch: Option<f64>) -> Result<Vec<PolicyRule>> {
    if !config.override_rules.is_empty() {
        return Ok(config.override_rules.clone());
    }

    let mut rules = default_policy();
    let extend = &config.extend;

    for (name, restriction) in &extend.restrictions {
        let rule = rules
            .iter_mut()
            .find(|r| &r.name == name)
            .ok_or_else(|| PolicyError::NotFound(name.clone()))?;
        rule.matches.extend(restriction.matches.iter().cloned());
        rule.condition.extend(restriction.condition.iter().cloned());
        rule.value.extend(restriction.value.iter().cloned());
    }

    for (name, hooks) in &extend.webhooks {
        let rule = rules
            .iter_mut()
            .find(|r| &r.name == name)
            .ok_or_else(|| PolicyError::NotFound(name.clone()))?;
        rule.webhooks = hooks.clone();
    }

    if let Some(latch) = green_energy_latch {
        rules[GREEN_ENERGY_RULE].latch_period = Some(latch);
    }

    for (extra, position) in [
        (&extend.after, 3usize),
        (&extend.before, 1),
        (&extend.emergency, 0),
    ] {
        rules.splice(position..position, extra.iter().cloned());
    }

    Ok(rules)
}

/// Evaluates the rule list and tracks the active policy
#[derive(Debug)]
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    /// Latch expiry (epoch seconds) per rule
    latches: Vec<Option<f64>>,
    active: Option<usize>,
    last_check: Option<f64>,
    check_interval: f64,
    limit_override: bool,
}

impl PolicyEngine {
    pub fn new(rules: &[PolicyRule], check_interval: f64) -> Result<Self> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            latches: vec![None; rules.len()],
            rules,
            active: None,
            last_check: None,
            check_interval,
            limit_override: false,
        })
    }

    pub fn from_config(config: &PolicyConfig, green_energy_latch: Option<f64>) -> Result<Self> {
        let rules = build_rules(config, green_energy_latch)?;
        Self::new(&rules, config.engine.policy_check_interval)
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Whether `evaluate` at `now` would run the rules
    pub fn is_due(&self, now: f64) -> bool {
        self.last_check.is_none_or(|last| last + self.check_interval <= now)
    }

    pub fn active_policy(&self) -> Option<&str> {
        self.active.map(|i| self.rules[i].name.as_str())
    }

    fn active_rule(&self) -> Option<&CompiledRule> {
        self.active.map(|i| &self.rules[i])
    }

    pub fn is_green(&self) -> bool {
        self.active_rule().is_some_and(CompiledRule::is_green)
    }

    /// Webhook URL of the active policy for the given trigger
    pub fn webhook(&self, hook: Hook) -> Option<String> {
        self.active_rule()
            .and_then(|r| r.webhooks.get(hook))
            .map(str::to_string)
    }

    /// Cap charge limits until the active policy changes
    pub fn override_limit(&mut self) {
        if !self.limit_override {
            tracing::info!("Charge stop has not taken effect; overriding charge limit");
        }
        self.limit_override = true;
    }

    pub fn clear_override(&mut self) {
        self.limit_override = false;
    }

    pub fn limit_overridden(&self) -> bool {
        self.limit_override
    }

    /// Evaluate now, ignoring the check interval
    pub fn apply_immediately<C: PolicyContext + ?Sized>(&mut self, ctx: &C) -> Vec<PolicyAction> {
        self.last_check = None;
        self.evaluate(ctx)
    }

    /// Evaluate if the check interval has elapsed
    pub fn evaluate<C: PolicyContext + ?Sized>(&mut self, ctx: &C) -> Vec<PolicyAction> {
        let now = ctx.now();
        if !self.is_due(now) {
            return Vec::new();
        }
        self.last_check = Some(now);

        for idx in 0..self.rules.len() {
            let latched = match self.latches[idx] {
                Some(until) if now < until => true,
                Some(_) => {
                    self.latches[idx] = None;
                    false
                },
                None => false,
            };

            let matched = check_conditions(&self.rules[idx].checks, ctx, false);
            if latched || matched {
                tracing::debug!(
                    "All policy conditions have matched. Policy chosen is {}",
                    self.rules[idx].name
                );
                return self.enforce(idx, matched, ctx);
            }
        }

        tracing::trace!("No policy matched; keeping the current policy");
        match self.active {
            Some(idx) => self.enforce(idx, false, ctx),
            None => Vec::new(),
        }
    }

    fn enforce<C: PolicyContext + ?Sized>(
        &mut self,
        idx: usize,
        update_latch: bool,
        ctx: &C,
    ) -> Vec<PolicyAction> {
        let mut actions = Vec::new();
        let now = ctx.now();

        let changed = self
            .active_rule()
            .map_or(true, |current| current.name != self.rules[idx].name);
        if changed {
            if let Some(url) = self.webhook(Hook::Exit) {
                actions.push(PolicyAction::Webhook(url));
            }
            tracing::info!("New policy selected; changing to {}", self.rules[idx].name);
            self.active = Some(idx);
            self.limit_override = false;
            if let Some(url) = self.webhook(Hook::Enter) {
                actions.push(PolicyAction::Webhook(url));
            }
        } else {
            self.active = Some(idx);
        }

        let rule = &self.rules[idx];
        if update_latch {
            if let Some(minutes) = rule.latch_period {
                self.latches[idx] = Some(now + minutes * 60.0);
            }
        }

        if let Some(amps) = &rule.charge_amps {
            match amps.resolve(ctx).as_f64() {
                Some(a) => {
                    tracing::debug!("Charge at {:.2}", a);
                    actions.push(PolicyAction::SetMaxAmps(a));
                },
                None => tracing::warn!("Policy {} charge_amps is not numeric", rule.name),
            }
        }

        let flex = rule
            .allowed_flex
            .as_ref()
            .and_then(|f| f.resolve(ctx).as_f64())
            .unwrap_or(0.0);
        actions.push(PolicyAction::SetAllowedFlex(flex));

        if let Some(task) = &rule.background_task {
            actions.push(PolicyAction::QueueTask(task.clone()));
        }

        let mut limit = rule
            .charge_limit
            .as_ref()
            .map(|l| l.resolve(ctx))
            .unwrap_or(Value::Number(-1.0))
            .as_f64()
            .unwrap_or(-1.0);
        if self.limit_override {
            let current = (ctx.min_battery_level_at_home() - 1.0).max(50.0);
            limit = if limit == -1.0 { current } else { limit.min(current) };
        }
        if !(50.0..=100.0).contains(&limit) {
            limit = -1.0;
        }
        actions.push(PolicyAction::ApplyChargeLimit(limit as i32));

        actions
    }
}
