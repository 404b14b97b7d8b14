//! External collaborators
//!
//! The controller talks to the outside world only through these traits.
//! Energy meters and the vehicle API are slow and are only ever called from
//! the worker task; the two sinks are cheap and may be called from the bus
//! task.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::{TwcError, TwcResult};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Client as HttpClient;
use tracing::{debug, info, warn};
use twc_protocol::TwcId;

use crate::config::{SourceConfig, StaticSourceConfig, UrlSourceConfig};

// ============================================================================
// Energy meters
// ============================================================================

/// One reading from one meter
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterReading {
    pub generation_w: f64,
    pub consumption_w: f64,
    /// Mains voltage and phase count, if the meter measures them
    pub voltage: Option<(f64, f64)>,
}

#[async_trait]
pub trait EnergyMeter: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self) -> TwcResult<MeterReading>;
}

/// Meter with fixed values
#[derive(Debug, Clone)]
pub struct StaticEnergyMeter {
    config: StaticSourceConfig,
}

impl StaticEnergyMeter {
    pub fn new(config: StaticSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EnergyMeter for StaticEnergyMeter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn read(&self) -> TwcResult<MeterReading> {
        Ok(MeterReading {
            generation_w: self.config.generation_w,
            consumption_w: self.config.consumption_w,
            voltage: self
                .config
                .voltage
                .map(|v| (v, self.config.phases.unwrap_or(1.0))),
        })
    }
}

/// Meter read over HTTP, one GET per item
///
/// The first number in each response body is taken as watts. Readings are
/// cached for `cacheTime` seconds.
#[derive(Debug)]
pub struct UrlEnergyMeter {
    config: UrlSourceConfig,
    http_client: HttpClient,
    cache: Mutex<Option<(Instant, MeterReading)>>,
}

impl UrlEnergyMeter {
    pub fn new(config: UrlSourceConfig) -> TwcResult<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()?;
        Ok(Self {
            config,
            http_client,
            cache: Mutex::new(None),
        })
    }

    fn item_url(&self, item: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), item)
    }

    async fn fetch(&self, item: &str) -> TwcResult<f64> {
        if item.is_empty() {
            return Ok(0.0);
        }
        let url = self.item_url(item);
        debug!("Polling {} item {}", self.config.name, url);

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TwcError::collaborator(
                &self.config.name,
                format!("{url} returned {status}"),
            ));
        }
        let body = response.text().await?;
        first_number(&body).ok_or_else(|| {
            TwcError::collaborator(&self.config.name, format!("no number in reply from {url}"))
        })
    }
}

#[async_trait]
impl EnergyMeter for UrlEnergyMeter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn read(&self) -> TwcResult<MeterReading> {
        if let Some((at, reading)) = *self.cache.lock() {
            if at.elapsed().as_secs_f64() < self.config.cache_time {
                return Ok(reading);
            }
        }

        let reading = MeterReading {
            generation_w: self.fetch(&self.config.generation_item).await?,
            consumption_w: self.fetch(&self.config.consumption_item).await?,
            voltage: None,
        };
        *self.cache.lock() = Some((Instant::now(), reading));
        Ok(reading)
    }
}

/// A decimal number standing on its own, not part of `1.2.3` or `10.0.0.1`
static STANDALONE_NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d.])(-?\d+(?:\.\d+)?)(?:$|[^\d.])").ok());

/// First standalone decimal number in `text`
pub fn first_number(text: &str) -> Option<f64> {
    let re = STANDALONE_NUMBER.as_ref()?;
    re.captures_iter(text)
        .find_map(|caps| caps.get(1).and_then(|m| m.as_str().parse().ok()))
}

/// Build the meters listed in the `sources` section
pub fn build_meters(sources: &[SourceConfig]) -> TwcResult<Vec<Arc<dyn EnergyMeter>>> {
    sources
        .iter()
        .map(|source| -> TwcResult<Arc<dyn EnergyMeter>> {
            info!("Energy meter {} configured", source.name());
            Ok(match source {
                SourceConfig::Url(c) => Arc::new(UrlEnergyMeter::new(c.clone())?),
                SourceConfig::Static(c) => Arc::new(StaticEnergyMeter::new(c.clone())),
            })
        })
        .collect()
}

// ============================================================================
// Vehicle API
// ============================================================================

#[async_trait]
pub trait VehicleApi: Send + Sync {
    /// Start charging cars at home; `twc` narrows it to one charger
    async fn start_charge(&self, twc: Option<TwcId>) -> TwcResult<()>;

    async fn stop_charge(&self, twc: Option<TwcId>) -> TwcResult<()>;

    async fn set_charge_rate(&self, vin: &str, amps: f64) -> TwcResult<()>;

    /// Apply a charge limit, -1 restores the one in force before
    async fn apply_charge_limit(
        &self,
        limit: i32,
        check_arrival: bool,
        check_departure: bool,
    ) -> TwcResult<()>;

    async fn wake(&self, vin: &str) -> TwcResult<()>;

    /// Lowest battery level among cars at home, 100 when unknown
    fn min_battery_level_at_home(&self) -> f64 {
        100.0
    }
}

/// A request seen by [`LoggingVehicleApi`]
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleRequest {
    Start(Option<TwcId>),
    Stop(Option<TwcId>),
    ChargeRate { vin: String, amps: f64 },
    ChargeLimit { limit: i32, check_arrival: bool, check_departure: bool },
    Wake(String),
}

/// Vehicle API that only records and logs what it is asked
#[derive(Debug, Default)]
pub struct LoggingVehicleApi {
    requests: Mutex<Vec<VehicleRequest>>,
}

impl LoggingVehicleApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<VehicleRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, request: VehicleRequest) {
        info!("Vehicle API request: {:?}", request);
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl VehicleApi for LoggingVehicleApi {
    async fn start_charge(&self, twc: Option<TwcId>) -> TwcResult<()> {
        self.record(VehicleRequest::Start(twc));
        Ok(())
    }

    async fn stop_charge(&self, twc: Option<TwcId>) -> TwcResult<()> {
        self.record(VehicleRequest::Stop(twc));
        Ok(())
    }

    async fn set_charge_rate(&self, vin: &str, amps: f64) -> TwcResult<()> {
        self.record(VehicleRequest::ChargeRate {
            vin: vin.to_string(),
            amps,
        });
        Ok(())
    }

    async fn apply_charge_limit(
        &self,
        limit: i32,
        check_arrival: bool,
        check_departure: bool,
    ) -> TwcResult<()> {
        self.record(VehicleRequest::ChargeLimit {
            limit,
            check_arrival,
            check_departure,
        });
        Ok(())
    }

    async fn wake(&self, vin: &str) -> TwcResult<()> {
        self.record(VehicleRequest::Wake(vin.to_string()));
        Ok(())
    }
}

/// Delay after consecutive collaborator failures
///
/// Grows 0, 30 s, 1, 2, 5, 10 min and stays at 10 min.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    errors: u32,
    until: f64,
    pub last_error_at: Option<f64>,
}

const BACKOFF_STEPS: [f64; 6] = [0.0, 30.0, 60.0, 120.0, 300.0, 600.0];

impl Backoff {
    pub fn ready(&self, now: f64) -> bool {
        now >= self.until
    }

    pub fn failure(&mut self, now: f64) {
        self.errors += 1;
        let idx = (self.errors as usize).min(BACKOFF_STEPS.len() - 1);
        self.until = now + BACKOFF_STEPS[idx];
        self.last_error_at = Some(now);
    }

    pub fn success(&mut self) {
        self.errors = 0;
        self.until = 0.0;
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives every reported or computed value that changes
pub trait StatusSink: Send + Sync {
    fn set_status(&self, twc: &TwcId, key: &str, value: &str, unit: &str);
}

/// Receives charge sessions and periodic readings
pub trait LoggingSink: Send + Sync {
    fn start_charge_session(&self, twc: &TwcId, start_kwh: f64, start_time: DateTime<Utc>);

    fn stop_charge_session(&self, twc: &TwcId, end_kwh: f64, end_time: DateTime<Utc>);

    fn update_charge_session(&self, twc: &TwcId, vin: &str);

    fn log_green_energy(&self, generation_w: f64, consumption_w: f64, charger_w: f64);

    fn log_slave_status(&self, twc: &TwcId, lifetime_kwh: f64, volts: [f64; 3]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn set_status(&self, twc: &TwcId, key: &str, value: &str, unit: &str) {
        debug!(twc = %twc, key, value, unit, "Status");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLoggingSink;

impl LoggingSink for TracingLoggingSink {
    fn start_charge_session(&self, twc: &TwcId, start_kwh: f64, start_time: DateTime<Utc>) {
        info!("Charge session started on TWC {twc} at {start_time}, meter {start_kwh:.0} kWh");
    }

    fn stop_charge_session(&self, twc: &TwcId, end_kwh: f64, end_time: DateTime<Utc>) {
        info!("Charge session ended on TWC {twc} at {end_time}, meter {end_kwh:.0} kWh");
    }

    fn update_charge_session(&self, twc: &TwcId, vin: &str) {
        info!("Charge session on TWC {twc} is vehicle {vin}");
    }

    fn log_green_energy(&self, generation_w: f64, consumption_w: f64, charger_w: f64) {
        info!(
            "Green energy: generation {generation_w:.0}W, consumption {consumption_w:.0}W, \
             charger {charger_w:.0}W"
        );
    }

    fn log_slave_status(&self, twc: &TwcId, lifetime_kwh: f64, volts: [f64; 3]) {
        info!(
            "TWC {twc}: lifetime {lifetime_kwh:.0} kWh, phases {:.0}/{:.0}/{:.0} V",
            volts[0], volts[1], volts[2]
        );
    }
}

/// Everything the service talks to outside the bus
#[derive(Clone)]
pub struct Collaborators {
    pub meters: Vec<Arc<dyn EnergyMeter>>,
    pub vehicle: Arc<dyn VehicleApi>,
    pub status: Arc<dyn StatusSink>,
    pub logging: Arc<dyn LoggingSink>,
}

impl Collaborators {
    /// Configured meters with the built-in vehicle API and sinks
    pub fn from_sources(sources: &[SourceConfig]) -> TwcResult<Self> {
        let meters = build_meters(sources)?;
        if meters.is_empty() {
            warn!("No energy sources configured; green energy tracking will see 0W");
        }
        Ok(Self {
            meters,
            vehicle: Arc::new(LoggingVehicleApi::new()),
            status: Arc::new(TracingStatusSink),
            logging: Arc::new(TracingLoggingSink),
        })
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            meters: Vec::new(),
            vehicle: Arc::new(LoggingVehicleApi::new()),
            status: Arc::new(TracingStatusSink),
            logging: Arc::new(TracingLoggingSink),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_first_number() {
        assert_eq!(first_number("1234.5"), Some(1234.5));
        assert_eq!(first_number("power: -42 W"), Some(-42.0));
        assert_eq!(first_number("{\"state\":\"812\"}"), Some(812.0));
        assert_eq!(first_number("n/a"), None);
        // Version strings and addresses are not readings
        assert_eq!(first_number("v1.2.3 power 400"), Some(400.0));
        assert_eq!(first_number("from 10.0.0.7: 2150.25 W"), Some(2150.25));
    }

    #[tokio::test]
    async fn test_static_meter() {
        let meter = StaticEnergyMeter::new(StaticSourceConfig {
            name: "roof".into(),
            generation_w: 5000.0,
            consumption_w: 800.0,
            voltage: Some(230.0),
            phases: None,
        });
        let reading = meter.read().await.unwrap();
        assert_eq!(reading.generation_w, 5000.0);
        assert_eq!(reading.voltage, Some((230.0, 1.0)));
    }

    #[tokio::test]
    async fn test_url_meter_reads_and_caches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Exactly two requests; a third would hang the test
            for body in ["3000", "1200.5"] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await.unwrap();
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let meter = UrlEnergyMeter::new(UrlSourceConfig {
            name: "URL".into(),
            url: format!("http://127.0.0.1:{port}/rest/items/"),
            generation_item: "Solar/state".into(),
            consumption_item: "House/state".into(),
            timeout: 2.0,
            cache_time: 60.0,
        })
        .unwrap();

        let reading = meter.read().await.unwrap();
        assert_eq!(reading.generation_w, 3000.0);
        assert_eq!(reading.consumption_w, 1200.5);
        assert_eq!(meter.read().await.unwrap(), reading);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_logging_vehicle_api_records() {
        let api = LoggingVehicleApi::new();
        api.start_charge(Some(TwcId::new(1, 2))).await.unwrap();
        api.apply_charge_limit(80, true, false).await.unwrap();
        assert_eq!(
            api.requests(),
            vec![
                VehicleRequest::Start(Some(TwcId::new(1, 2))),
                VehicleRequest::ChargeLimit {
                    limit: 80,
                    check_arrival: true,
                    check_departure: false
                },
            ]
        );
        assert_eq!(api.min_battery_level_at_home(), 100.0);
    }

    #[test]
    fn test_backoff_escalates() {
        let mut backoff = Backoff::default();
        assert!(backoff.ready(0.0));
        backoff.failure(100.0);
        assert!(!backoff.ready(110.0));
        assert!(backoff.ready(130.0));
        for _ in 0..10 {
            backoff.failure(200.0);
        }
        assert!(!backoff.ready(799.0));
        assert!(backoff.ready(800.0));
        backoff.success();
        assert!(backoff.ready(200.0));
        assert_eq!(backoff.last_error_at, Some(200.0));
    }

    #[test]
    fn test_build_meters() {
        let sources = vec![SourceConfig::Static(StaticSourceConfig::default())];
        assert_eq!(build_meters(&sources).unwrap().len(), 1);
    }
}
