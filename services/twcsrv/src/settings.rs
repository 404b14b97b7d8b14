//! Persisted user settings
//!
//! One keyed document shared by the bus and worker tasks behind a single
//! mutex. Policy rules read it by serialized key (`settings.X`), so field
//! names on the wire are part of the contract. Keys this build does not
//! know are kept in `extra` and written back untouched.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use errors::{TwcError, TwcResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

/// The settings document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub charge_now_amps: f64,
    /// Epoch seconds at which charge-now ends
    pub charge_now_time_end: f64,

    pub scheduled_amps_max: f64,
    pub scheduled_amps_start_hour: f64,
    pub scheduled_amps_end_hour: f64,
    /// Bit 0 is Monday
    pub scheduled_amps_days_bitmap: u8,
    pub scheduled_amps_battery_size: f64,
    pub scheduled_amps_flex_start: u8,

    pub non_scheduled_amps_max: f64,
    /// 1 and 2 charge at nonScheduledAmpsMax, 3 tracks green energy
    pub non_scheduled_action: u8,
    pub hour_resume_track_green_energy: f64,

    /// 1 = vehicle API, 2 = stop responding to slaves, 3 = stop command
    pub charge_stop_mode: u8,
    pub respond_to_slaves: u8,
    pub respond_to_slaves_expiry: f64,

    /// 1 = every vehicle may charge, 2 = only `allowedVins`
    pub charge_authorization_mode: u8,
    pub allowed_vins: Vec<String>,

    #[serde(rename = "kWhDelivered")]
    pub kwh_delivered: f64,
    pub history: Vec<HistoryEntry>,

    pub home_lat: f64,
    pub home_lon: f64,

    pub consumption_offsets: BTreeMap<String, ConsumptionOffset>,

    #[serde(rename = "Vehicles")]
    pub vehicles: BTreeMap<String, VehicleRecord>,
    #[serde(rename = "SlaveTWCs")]
    pub slave_twcs: BTreeMap<String, SlaveRecord>,
    #[serde(rename = "Schedule")]
    pub schedule: BTreeMap<String, ScheduleDay>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            charge_now_amps: 0.0,
            charge_now_time_end: 0.0,
            scheduled_amps_max: -1.0,
            scheduled_amps_start_hour: -1.0,
            scheduled_amps_end_hour: -1.0,
            scheduled_amps_days_bitmap: 0x7F,
            scheduled_amps_battery_size: 100.0,
            scheduled_amps_flex_start: 0,
            non_scheduled_amps_max: -1.0,
            non_scheduled_action: 1,
            hour_resume_track_green_energy: -1.0,
            charge_stop_mode: 1,
            respond_to_slaves: 1,
            respond_to_slaves_expiry: 0.0,
            charge_authorization_mode: 1,
            allowed_vins: Vec::new(),
            kwh_delivered: 0.0,
            history: Vec::new(),
            home_lat: 10000.0,
            home_lon: 10000.0,
            consumption_offsets: BTreeMap::new(),
            vehicles: BTreeMap::new(),
            slave_twcs: BTreeMap::new(),
            schedule: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// One 5-minute sample of charger load
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub watts: f64,
}

/// A named adjustment added to measured consumption
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumptionOffset {
    pub value: f64,
    /// "W" or "A"
    #[serde(default = "default_offset_unit")]
    pub unit: String,
}

fn default_offset_unit() -> String {
    "W".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VehicleRecord {
    #[serde(rename = "chargeSessions", default)]
    pub charge_sessions: u32,
    #[serde(rename = "startkWh", default)]
    pub start_kwh: f64,
    #[serde(rename = "totalkWh", default)]
    pub total_kwh: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlaveRecord {
    #[serde(rename = "supportsVINQuery", default)]
    pub supports_vin_query: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleDay {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub flex: bool,
}

/// How long charge history is kept
const HISTORY_KEEP_HOURS: i64 = 24;

impl Settings {
    /// Serialized form, used to answer `settings.X` policy lookups
    pub fn to_map(&self) -> Map<String, JsonValue> {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Set one key by its serialized name
    ///
    /// The document is re-read afterwards, so a value of the wrong type is
    /// rejected and leaves the settings unchanged.
    pub fn set(&mut self, key: &str, value: JsonValue) -> TwcResult<()> {
        let mut map = self.to_map();
        map.insert(key.to_string(), value);
        let updated: Settings = serde_json::from_value(JsonValue::Object(map))
            .map_err(|e| TwcError::Settings(format!("Invalid value for {key}: {e}")))?;
        *self = updated;
        Ok(())
    }

    /// Append a history sample and drop samples older than a day
    pub fn push_history(&mut self, timestamp: DateTime<Utc>, watts: f64) {
        self.history.push(HistoryEntry { timestamp, watts });
        let cutoff = timestamp - ChronoDuration::hours(HISTORY_KEEP_HOURS);
        self.history.retain(|h| h.timestamp > cutoff);
    }

    /// Whether a vehicle with this VIN may charge
    pub fn vin_allowed(&self, vin: &str) -> bool {
        match self.charge_authorization_mode {
            2 => self.allowed_vins.iter().any(|v| v == vin),
            _ => true,
        }
    }

    /// Sum of consumption offsets in watts
    pub fn consumption_offset_watts(&self, volts_times_phases: f64) -> f64 {
        self.consumption_offsets
            .values()
            .map(|o| {
                if o.unit.eq_ignore_ascii_case("A") {
                    o.value * volts_times_phases
                } else {
                    o.value
                }
            })
            .sum()
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Where settings live between restarts
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load settings; a store with nothing saved yields defaults
    async fn load(&self) -> TwcResult<Settings>;

    async fn save(&self, settings: &Settings) -> TwcResult<()>;
}

/// Pretty JSON in `<dir>/settings.json`, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("settings.json")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("settings.json.tmp")
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self) -> TwcResult<Settings> {
        let path = self.path();
        if !tokio::fs::try_exists(&path).await? {
            info!("No settings at {}, starting from defaults", path.display());
            return Ok(Settings::default());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let settings = serde_json::from_str(&content)
            .map_err(|e| TwcError::Settings(format!("Unreadable {}: {e}", path.display())))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    async fn save(&self, settings: &Settings) -> TwcResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let content = serde_json::to_string_pretty(settings)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, self.path()).await?;
        debug!("Saved settings to {}", self.path().display());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_and_wire_names() {
        let settings = Settings::default();
        let map = settings.to_map();
        assert_eq!(map.get("scheduledAmpsMax"), Some(&json!(-1.0)));
        assert_eq!(map.get("scheduledAmpsDaysBitmap"), Some(&json!(0x7F)));
        assert_eq!(map.get("chargeStopMode"), Some(&json!(1)));
        assert_eq!(map.get("nonScheduledAction"), Some(&json!(1)));
        assert!(map.contains_key("kWhDelivered"));
        assert!(map.contains_key("Vehicles"));
        assert!(map.contains_key("SlaveTWCs"));
    }

    #[test]
    fn test_set_by_key() {
        let mut settings = Settings::default();
        settings.set("chargeNowAmps", json!(32)).unwrap();
        assert_eq!(settings.charge_now_amps, 32.0);

        let err = settings.set("chargeStopMode", json!("often")).unwrap_err();
        assert_eq!(err.error_code(), "SETTINGS_ERROR");
        assert_eq!(settings.charge_stop_mode, 1);

        settings.set("customFlag", json!(true)).unwrap();
        assert_eq!(settings.extra.get("customFlag"), Some(&json!(true)));
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let doc = json!({
            "chargeNowAmps": 16,
            "carApiBearerToken": "abc",
            "Vehicles": {"5YJ3E1EA1JF000123": {"chargeSessions": 2, "startkWh": 10.5, "totalkWh": 30}}
        });
        let settings: Settings = serde_json::from_value(doc).unwrap();
        assert_eq!(settings.charge_now_amps, 16.0);
        assert_eq!(settings.vehicles["5YJ3E1EA1JF000123"].charge_sessions, 2);
        assert_eq!(settings.to_map().get("carApiBearerToken"), Some(&json!("abc")));
    }

    #[test]
    fn test_history_keeps_one_day() {
        let mut settings = Settings::default();
        let t0 = Utc::now();
        settings.push_history(t0 - ChronoDuration::hours(25), 100.0);
        settings.push_history(t0 - ChronoDuration::hours(1), 200.0);
        settings.push_history(t0, 300.0);
        assert_eq!(settings.history.len(), 2);
        assert_eq!(settings.history[0].watts, 200.0);
    }

    #[test]
    fn test_vin_authorization() {
        let mut settings = Settings::default();
        assert!(settings.vin_allowed("ANY"));
        settings.charge_authorization_mode = 2;
        settings.allowed_vins = vec!["5YJ3E1EA1JF000123".into()];
        assert!(settings.vin_allowed("5YJ3E1EA1JF000123"));
        assert!(!settings.vin_allowed("OTHER"));
    }

    #[test]
    fn test_consumption_offsets() {
        let mut settings = Settings::default();
        settings.consumption_offsets.insert(
            "pool".into(),
            ConsumptionOffset { value: 500.0, unit: "W".into() },
        );
        settings.consumption_offsets.insert(
            "heater".into(),
            ConsumptionOffset { value: 2.0, unit: "A".into() },
        );
        assert_eq!(settings.consumption_offset_watts(240.0), 980.0);
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("data"));

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, Settings::default());

        let mut settings = Settings::default();
        settings.kwh_delivered = 12.5;
        settings
            .slave_twcs
            .insert("1122".into(), SlaveRecord { supports_vin_query: 1 });
        store.save(&settings).await.unwrap();

        assert!(store.path().exists());
        assert!(!dir.path().join("data/settings.json.tmp").exists());
        assert_eq!(store.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "not json").unwrap();
        let store = JsonSettingsStore::new(dir.path());
        let err = store.load().await.unwrap_err();
        assert_eq!(err.error_code(), "SETTINGS_ERROR");
    }
}
