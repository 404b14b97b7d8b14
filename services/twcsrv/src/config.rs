//! Service configuration types
//!
//! Loaded once at startup through `common::load_config` (defaults, file,
//! then `TWCSRV_` environment variables). Keys under `config` keep the
//! camelCase names policy rules use to reference them (`config.X`).

use errors::{TwcError, TwcResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use twc_policy::{PolicyConfig, PolicyEngine};

use crate::transport::InterfaceConfig;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub config: CoreConfig,
    pub interface: InterfaceConfig,
    pub policy: PolicyConfig,
    pub sources: Vec<SourceConfig>,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Check every section, stopping at the first problem
    pub fn validate(&self) -> TwcResult<()> {
        self.config.validate()?;

        self.interface
            .validate()
            .map_err(|e| invalid("interface", e.to_string()))?;

        PolicyEngine::from_config(&self.policy, None).map_err(|e| invalid("policy", e.to_string()))?;

        for source in &self.sources {
            source.validate()?;
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> TwcError {
    TwcError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Core section
// ============================================================================

/// The `config` section: wiring limits and controller tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Current the shared upstream circuit can carry
    #[serde(rename = "wiringMaxAmpsAllTWCs", default = "default_wiring_amps")]
    pub wiring_max_amps_all_twcs: f64,

    /// Current the wiring of each single TWC can carry
    #[serde(rename = "wiringMaxAmpsPerTWC", default = "default_wiring_amps")]
    pub wiring_max_amps_per_twc: f64,

    /// Below this a car is not worth charging
    #[serde(rename = "minAmpsPerTWC", default = "default_min_amps_per_twc")]
    pub min_amps_per_twc: f64,

    #[serde(default)]
    pub use_flex_amps_to_start_charge: bool,

    /// Seconds between start/stop flips on a green policy
    #[serde(default = "default_start_stop_delay")]
    pub start_stop_delay: f64,

    #[serde(default)]
    pub subtract_charger_load: bool,

    #[serde(default = "default_voltage")]
    pub default_voltage: f64,

    #[serde(default = "default_phases")]
    pub number_of_phases: f64,

    #[serde(default = "default_power_factor")]
    pub real_power_factor_min_amps: f64,

    #[serde(default = "default_power_factor")]
    pub real_power_factor_max_amps: f64,

    /// Watts kept back from the green budget
    #[serde(default)]
    pub green_energy_amps_offset: f64,

    #[serde(default)]
    pub green_energy_flex_amps: f64,

    /// Minutes the green rule stays latched once matched
    #[serde(default)]
    pub green_energy_latch: f64,

    #[serde(default)]
    pub charge_now_limit: f64,

    #[serde(default)]
    pub scheduled_limit: f64,

    #[serde(default)]
    pub green_energy_limit: f64,

    #[serde(default)]
    pub non_scheduled_limit: f64,

    /// GET or POST
    #[serde(default = "default_webhook_method")]
    pub webhook_method: String,

    /// Directory holding settings.json
    #[serde(default = "default_settings_path")]
    pub settings_path: String,

    #[serde(default = "default_true")]
    pub spike_amps_proactively: bool,

    #[serde(default = "default_true")]
    pub spike_amps_reactively: bool,

    /// 1 = through heartbeats, 2 = through the vehicle API
    #[serde(default = "default_charge_rate_control")]
    pub charge_rate_control: u8,
}

fn default_wiring_amps() -> f64 {
    6.0
}

fn default_min_amps_per_twc() -> f64 {
    12.0
}

fn default_start_stop_delay() -> f64 {
    60.0
}

fn default_voltage() -> f64 {
    240.0
}

fn default_phases() -> f64 {
    1.0
}

fn default_power_factor() -> f64 {
    1.0
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_settings_path() -> String {
    "data".to_string()
}

fn default_true() -> bool {
    true
}

fn default_charge_rate_control() -> u8 {
    1
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            wiring_max_amps_all_twcs: default_wiring_amps(),
            wiring_max_amps_per_twc: default_wiring_amps(),
            min_amps_per_twc: default_min_amps_per_twc(),
            use_flex_amps_to_start_charge: false,
            start_stop_delay: default_start_stop_delay(),
            subtract_charger_load: false,
            default_voltage: default_voltage(),
            number_of_phases: default_phases(),
            real_power_factor_min_amps: default_power_factor(),
            real_power_factor_max_amps: default_power_factor(),
            green_energy_amps_offset: 0.0,
            green_energy_flex_amps: 0.0,
            green_energy_latch: 0.0,
            charge_now_limit: 0.0,
            scheduled_limit: 0.0,
            green_energy_limit: 0.0,
            non_scheduled_limit: 0.0,
            webhook_method: default_webhook_method(),
            settings_path: default_settings_path(),
            spike_amps_proactively: default_true(),
            spike_amps_reactively: default_true(),
            charge_rate_control: default_charge_rate_control(),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> TwcResult<()> {
        if self.wiring_max_amps_all_twcs <= 0.0 {
            return Err(invalid("wiringMaxAmpsAllTWCs", "must be greater than zero"));
        }
        if self.wiring_max_amps_per_twc <= 0.0 {
            return Err(invalid("wiringMaxAmpsPerTWC", "must be greater than zero"));
        }
        if self.wiring_max_amps_per_twc > self.wiring_max_amps_all_twcs {
            return Err(invalid(
                "wiringMaxAmpsPerTWC",
                "cannot exceed wiringMaxAmpsAllTWCs",
            ));
        }
        if self.min_amps_per_twc < 0.0 {
            return Err(invalid("minAmpsPerTWC", "cannot be negative"));
        }
        if !(1.0..=3.0).contains(&self.number_of_phases) {
            return Err(invalid("numberOfPhases", "must be between 1 and 3"));
        }
        if self.default_voltage <= 0.0 {
            return Err(invalid("defaultVoltage", "must be greater than zero"));
        }
        if !matches!(self.charge_rate_control, 1 | 2) {
            return Err(invalid("chargeRateControl", "must be 1 or 2"));
        }
        if !matches!(self.webhook_method.to_uppercase().as_str(), "GET" | "POST") {
            return Err(invalid("webhookMethod", "must be GET or POST"));
        }
        Ok(())
    }

    /// Serialized form, used to answer `config.X` policy lookups
    pub fn to_map(&self) -> Map<String, JsonValue> {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Green-energy latch in minutes, `None` when disabled
    pub fn green_energy_latch(&self) -> Option<f64> {
        (self.green_energy_latch > 0.0).then_some(self.green_energy_latch)
    }
}

// ============================================================================
// Energy sources
// ============================================================================

/// One entry of the `sources` list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Generation and consumption read over HTTP
    Url(UrlSourceConfig),
    /// Fixed readings, for tests and installations without a meter
    Static(StaticSourceConfig),
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Url(c) => &c.name,
            Self::Static(c) => &c.name,
        }
    }

    fn validate(&self) -> TwcResult<()> {
        match self {
            Self::Url(c) => {
                if c.url.is_empty() {
                    return Err(invalid("sources.url", "url cannot be empty"));
                }
                if c.generation_item.is_empty() && c.consumption_item.is_empty() {
                    return Err(invalid(
                        "sources.url",
                        "need a generationItem or a consumptionItem",
                    ));
                }
                if c.timeout <= 0.0 {
                    return Err(invalid("sources.url", "timeout must be positive"));
                }
                Ok(())
            },
            Self::Static(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UrlSourceConfig {
    #[serde(default = "default_url_source_name")]
    pub name: String,
    /// Base URL; items are appended as path segments
    pub url: String,
    #[serde(default)]
    pub generation_item: String,
    #[serde(default)]
    pub consumption_item: String,
    /// Request timeout in seconds
    #[serde(default = "default_source_timeout")]
    pub timeout: f64,
    /// Seconds a reading is reused before polling again
    #[serde(default = "default_cache_time")]
    pub cache_time: f64,
}

fn default_url_source_name() -> String {
    "URL".to_string()
}

fn default_source_timeout() -> f64 {
    2.0
}

fn default_cache_time() -> f64 {
    10.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticSourceConfig {
    pub name: String,
    pub generation_w: f64,
    pub consumption_w: f64,
    /// Mains voltage and phase count, if this source measures them
    pub voltage: Option<f64>,
    pub phases: Option<f64>,
}

// ============================================================================
// Logging
// ============================================================================

/// The `logging` section; CLI flags take precedence
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub log_dir: Option<String>,
    pub json: bool,
    /// Also write a daily log file
    pub file: bool,
}
