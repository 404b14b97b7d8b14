//! Per-slave amperage controller
//!
//! [`SlaveState::step`] runs once for every heartbeat a slave sends. It
//! records what the slave reported, decides how many amps to offer next and
//! returns the side effects as [`SlaveEvent`]s for the core to act on. It
//! performs no I/O and reads the clock only through `now`, so every rule
//! here can be driven directly from tests.
//!
//! ```text
//! heartbeat ─► record ─► edges ─► share ─► flex ─► collapse/spike/hold
//!                                                        │
//!             heartbeat data ◄─ commit ◄─ clamp ◄─ dampen┘
//! ```

use serde::Serialize;
use tracing::{debug, info, warn};
use twc_protocol::{HeartbeatData, ProtocolVersion, SlaveHeartbeat, SlaveStatus, TwcId, VinPart};

use crate::config::CoreConfig;

/// Seconds without any frame before a slave is dropped
pub const SLAVE_TIMEOUT_SECS: f64 = 26.0;
/// Reported amps at or above which a car counts as charging
pub const CHARGING_THRESHOLD_AMPS: f64 = 1.0;
/// A lower offer is not sent within this many seconds of the last change
const REDUCTION_HOLD_SECS: f64 = 5.0;
/// Change in reported amps that counts as significant
const SIGNIFICANT_CHANGE_AMPS: f64 = 0.8;
/// Seconds a slave must sit below its offer before a reactive spike
const SPIKE_SETTLE_SECS: f64 = 10.0;
/// Seconds between VIN query sequences for one slave
pub const VIN_RETRY_SECS: f64 = 60.0;
pub const VIN_MAX_ATTEMPTS: u32 = 6;
/// A car that has not woken after this long is worth an error in the log
pub const WAKE_GIVE_UP_SECS: f64 = 60.0 * 60.0;
const CHARGE_RATE_MIN_INTERVAL_SECS: f64 = 15.0;
const CHARGE_RATE_MAX_REPEATS: u32 = 50;

/// Load of another slave as seen when this one is stepped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerLoad {
    pub amps_actual: f64,
    /// Last committed offer, negative before the first one
    pub amps_offered: f64,
}

/// Everything outside the slave that one step depends on
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub heartbeat: &'a SlaveHeartbeat,
    /// Budget shared by all slaves
    pub max_amps_to_divide: f64,
    pub allowed_flex: f64,
    /// Whether the active policy tracks green energy
    pub green: bool,
    pub others: &'a [PeerLoad],
}

/// Side effects of one step
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    /// A reported or computed value changed
    Status {
        key: &'static str,
        value: String,
        unit: &'static str,
    },
    /// Draw rose past 3 A
    Arrived,
    /// Draw fell below 2 A
    Departed,
    ChargingStarted {
        start_kwh: f64,
    },
    /// `vin` is the vehicle that was charging, if it was identified
    ChargingStopped {
        vin: Option<String>,
    },
    /// Ask the vehicle API to charge at `amps`
    SetChargeRate {
        amps: f64,
        vin: String,
    },
    /// The slave has a non-zero offer, so any pending stop is moot
    WantsAmps,
}

/// Result of feeding one VIN reply to a slave
#[derive(Debug, Clone, PartialEq)]
pub enum VinProgress {
    /// Ask for the next part
    Next(VinPart),
    Complete(String),
    /// Assembly was not 17 characters, start over
    Restart,
}

/// What the outgoing heartbeat should do to a protocol 2 slave's car
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeControl {
    Keep,
    Stop,
    CancelStop,
    Start,
}

/// One discovered slave TWC
#[derive(Debug, Clone)]
pub struct SlaveState {
    pub id: TwcId,
    pub sign: u8,
    pub protocol: ProtocolVersion,
    /// Hardware rating from linkready
    pub max_amps: f64,
    /// Per-TWC wiring cap in force for this slave
    pub wiring_max_amps: f64,
    pub min_amps_supported: f64,
    pub spike_amps: f64,

    pub reported_state: SlaveStatus,
    pub reported_amps_max: f64,
    pub reported_amps_actual: f64,

    pub last_amps_offered: f64,
    pub last_amps_desired: f64,
    pub heartbeat_data: HeartbeatData,

    pub time_last_rx: f64,
    pub time_last_amps_offered_changed: f64,
    pub time_amps_actual_changed_significantly: f64,
    pub time_last_amps_desired_flipped: f64,
    amps_actual_monitor: f64,

    pub is_charging: bool,
    pub last_charging_start: f64,
    pub current_vin: String,
    pub last_vin: String,
    vin_parts: [Option<String>; 3],
    pub vin_query_attempt: u32,
    pub last_vin_query: f64,

    /// When we started trying to wake the car, 0 when not waking
    pub first_wake_attempt_time: f64,
    last_wake_attempt: f64,

    pub lifetime_kwh: f64,
    pub volts: [f64; 3],
    pub last_voltage_request: f64,

    pub history_avg_amps: f64,
    pub history_num_samples: u32,

    charge_rate_last_request: f64,
    charge_rate_last_amps: Option<i64>,
    charge_rate_repeat: u32,
}

impl SlaveState {
    /// A slave just announced itself with a linkready
    pub fn new(
        id: TwcId,
        sign: u8,
        max_amps: f64,
        protocol: ProtocolVersion,
        config: &CoreConfig,
        now: f64,
    ) -> Self {
        let mut wiring_max_amps = config.wiring_max_amps_per_twc;
        if wiring_max_amps > max_amps {
            warn!(
                "DANGER: wiringMaxAmpsPerTWC ({:.0}A) is above the {:.0}A rating of TWC {}, \
                 using {:.2}A until the configuration is fixed",
                wiring_max_amps,
                max_amps,
                id,
                max_amps / 4.0
            );
            wiring_max_amps = max_amps / 4.0;
        }

        Self {
            id,
            sign,
            protocol,
            max_amps,
            wiring_max_amps,
            min_amps_supported: protocol.min_amps_supported(),
            spike_amps: if max_amps >= 80.0 { 21.0 } else { 16.0 },
            reported_state: SlaveStatus::Ready,
            reported_amps_max: 0.0,
            reported_amps_actual: 0.0,
            last_amps_offered: -1.0,
            last_amps_desired: -1.0,
            heartbeat_data: HeartbeatData::IDLE,
            time_last_rx: now,
            time_last_amps_offered_changed: 0.0,
            time_amps_actual_changed_significantly: 0.0,
            time_last_amps_desired_flipped: 0.0,
            amps_actual_monitor: -1.0,
            is_charging: false,
            last_charging_start: 0.0,
            current_vin: String::new(),
            last_vin: String::new(),
            vin_parts: [None, None, None],
            vin_query_attempt: 0,
            last_vin_query: 0.0,
            first_wake_attempt_time: 0.0,
            last_wake_attempt: 0.0,
            lifetime_kwh: 0.0,
            volts: [0.0; 3],
            last_voltage_request: 0.0,
            history_avg_amps: 0.0,
            history_num_samples: 0,
            charge_rate_last_request: now + 30.0,
            charge_rate_last_amps: None,
            charge_rate_repeat: 0,
        }
    }

    /// Lowest offer that lets this slave charge
    pub fn min_offer(&self, config: &CoreConfig) -> f64 {
        config.min_amps_per_twc.max(self.min_amps_supported)
    }

    pub fn is_stale(&self, now: f64) -> bool {
        now - self.time_last_rx > SLAVE_TIMEOUT_SECS
    }

    pub fn peer_load(&self) -> PeerLoad {
        PeerLoad {
            amps_actual: self.reported_amps_actual,
            amps_offered: self.last_amps_offered,
        }
    }

    /// Any frame from the slave keeps it alive
    pub fn touch(&mut self, now: f64) {
        self.time_last_rx = now;
    }

    /// Process one heartbeat and compute the next offer
    pub fn step(&mut self, input: &StepInput<'_>, config: &CoreConfig, now: f64) -> Vec<SlaveEvent> {
        let mut events = Vec::new();
        let actual = input.heartbeat.amps_actual;

        // ============ Record ============
        if input.heartbeat.state != self.reported_state {
            let code = format!("{:02X}", input.heartbeat.state.code());
            events.push(status("state", code, ""));
        }
        if input.heartbeat.amps_max != self.reported_amps_max {
            events.push(status("amps_max", format!("{:.2}", input.heartbeat.amps_max), "A"));
        }
        self.reported_state = input.heartbeat.state;
        self.reported_amps_max = input.heartbeat.amps_max;
        self.reported_amps_actual = actual;
        self.time_last_rx = now;

        self.history_avg_amps = (self.history_avg_amps * f64::from(self.history_num_samples)
            + actual)
            / f64::from(self.history_num_samples + 1);
        self.history_num_samples += 1;

        if self.last_amps_offered < 0.0 {
            self.last_amps_offered = self.reported_amps_max;
        }

        // ============ Edges ============
        if self.amps_actual_monitor < 3.0 && actual > 3.0 {
            info!("Car plugged in and drawing {:.2}A on TWC {}", actual, self.id);
            events.push(SlaveEvent::Arrived);
        } else if self.amps_actual_monitor > 2.0 && actual < 2.0 {
            info!("Car stopped drawing on TWC {}", self.id);
            events.push(SlaveEvent::Departed);
        }

        if self.amps_actual_monitor < 0.0
            || (actual - self.amps_actual_monitor).abs() > SIGNIFICANT_CHANGE_AMPS
        {
            self.time_amps_actual_changed_significantly = now;
            self.amps_actual_monitor = actual;
            events.push(status("amps_in_use", format!("{actual:.2}"), "A"));
        }

        let charging = actual >= CHARGING_THRESHOLD_AMPS;
        if charging && !self.is_charging {
            self.is_charging = true;
            self.last_charging_start = now;
            self.first_wake_attempt_time = 0.0;
            self.vin_parts = [None, None, None];
            self.vin_query_attempt = 0;
            self.last_vin_query = 0.0;
            events.push(SlaveEvent::ChargingStarted {
                start_kwh: self.lifetime_kwh,
            });
        } else if !charging && self.is_charging {
            self.is_charging = false;
            self.vin_parts = [None, None, None];
            let vin = if self.current_vin.is_empty() {
                None
            } else {
                self.last_vin = std::mem::take(&mut self.current_vin);
                Some(self.last_vin.clone())
            };
            events.push(SlaveEvent::ChargingStopped { vin });
        }

        // ============ Share ============
        let charging_others: Vec<&PeerLoad> = input
            .others
            .iter()
            .filter(|p| p.amps_actual >= CHARGING_THRESHOLD_AMPS)
            .collect();
        let num_charging = charging_others.len() + usize::from(charging);
        let budget = input.max_amps_to_divide;

        let (mut desired, flex) = if num_charging > 0 {
            let others_actual: f64 = input.others.iter().map(|p| p.amps_actual).sum();
            let n = num_charging as f64;
            let fair_share = (budget / n).floor();
            ((budget - others_actual).min(fair_share), input.allowed_flex / n)
        } else {
            (budget, input.allowed_flex)
        };

        let min_offer = self.min_offer(config);
        if desired < min_offer
            && desired + flex >= min_offer
            && (config.use_flex_amps_to_start_charge || charging)
        {
            debug!("TWC {}: flex raises {:.2}A to {:.2}A", self.id, desired, min_offer);
            desired = min_offer;
        }

        let dampen = input.green
            && now - self.time_last_amps_desired_flipped < config.start_stop_delay;
        if !input.green {
            self.time_last_amps_desired_flipped = 0.0;
        }

        // ============ Offer ============
        if desired < min_offer {
            desired = if num_charging > 0 && budget / num_charging as f64 > min_offer {
                self.min_amps_supported
            } else {
                0.0
            };
        } else if config.charge_rate_control == 2 {
            self.request_charge_rate(desired.floor(), now, &mut events);
            desired = self.wiring_max_amps;
        } else {
            desired = desired.floor();
            desired = self.spike_or_hold(desired, actual, config, now);
        }

        if dampen && self.last_amps_desired > 0.0 && desired <= 0.0 {
            debug!("TWC {}: keeping charge alive during start/stop delay", self.id);
            desired = self.min_amps_supported;
        } else if dampen && self.last_amps_desired <= 0.0 && desired > 0.0 {
            debug!("TWC {}: holding off start during start/stop delay", self.id);
            desired = 0.0;
        }

        // Every reduction waits out the hold, whichever path produced it
        if desired < self.last_amps_offered
            && now - self.time_last_amps_offered_changed < REDUCTION_HOLD_SECS
        {
            desired = self.last_amps_offered;
        }

        // ============ Clamp ============
        let others_offered: f64 = input.others.iter().map(|p| p.amps_offered.max(0.0)).sum();
        let room = config.wiring_max_amps_all_twcs - others_offered;
        if desired > room {
            let clamped = room.floor().max(0.0);
            warn!(
                "Wiring capacity exceeded: TWC {} wanted {:.0}A but only {:.0}A is left of \
                 wiringMaxAmpsAllTWCs {:.0}A",
                self.id, desired, clamped, config.wiring_max_amps_all_twcs
            );
            desired = clamped;
        }
        desired = desired.min(self.wiring_max_amps);
        if desired > 0.0 && desired < self.min_amps_supported {
            desired = 0.0;
        }

        // ============ Commit ============
        if desired != self.last_amps_offered {
            debug!(
                "TWC {}: offer {:.2}A -> {:.2}A (reported max {:.2}A, actual {:.2}A)",
                self.id, self.last_amps_offered, desired, self.reported_amps_max, actual
            );
            self.time_last_amps_offered_changed = now;
            self.last_amps_offered = desired;
            events.push(status("amps_offered", format!("{desired:.2}"), "A"));
        }

        if (self.last_amps_desired <= 0.0 && desired > 0.0)
            || (self.last_amps_desired > 0.0 && desired == 0.0)
        {
            self.last_amps_desired = desired;
            self.time_last_amps_desired_flipped = now;
        }

        if desired > 0.0 {
            events.push(SlaveEvent::WantsAmps);
        }

        self.heartbeat_data = if self.reported_amps_max != desired || desired == 0.0 {
            HeartbeatData::set_amps(self.protocol, desired)
        } else {
            HeartbeatData::IDLE
        };

        events
    }

    /// Work around the firmware that pins a car at 6A after a raise
    fn spike_or_hold(&self, desired: f64, actual: f64, config: &CoreConfig, now: f64) -> f64 {
        let spike = self.spike_amps;
        let last = self.last_amps_offered;
        let since_change = now - self.time_last_amps_offered_changed;

        let proactive = config.spike_amps_proactively
            && desired < spike
            && desired > self.reported_amps_max;
        // A raise while the car sits at or under the spike value
        let pinned_raise = config.spike_amps_proactively
            && desired > last
            && last > 0.0
            && last != spike
            && actual > 2.0
            && actual <= spike;
        let reactive = config.spike_amps_reactively
            && actual > 2.0
            && actual <= spike
            && last - actual > 2.0
            && now - self.time_amps_actual_changed_significantly > SPIKE_SETTLE_SECS;

        if proactive || pinned_raise || reactive {
            if last == spike && since_change > SPIKE_SETTLE_SECS {
                spike - 2.0
            } else if since_change > REDUCTION_HOLD_SECS {
                debug!("TWC {}: spiking to {:.0}A", self.id, spike);
                spike
            } else {
                last
            }
        } else if (desired < last || last == spike) && since_change < REDUCTION_HOLD_SECS {
            last
        } else {
            desired
        }
    }

    fn request_charge_rate(&mut self, amps: f64, now: f64, events: &mut Vec<SlaveEvent>) {
        let whole = amps as i64;
        let same = self.charge_rate_last_amps == Some(whole);
        let throttled = same
            && (self.charge_rate_repeat > CHARGE_RATE_MAX_REPEATS
                || self.charge_rate_repeat % 10 != 0);
        if throttled || self.charge_rate_last_request > now - CHARGE_RATE_MIN_INTERVAL_SECS {
            self.charge_rate_repeat += 1;
            return;
        }

        self.charge_rate_repeat = if same { self.charge_rate_repeat + 1 } else { 0 };
        self.charge_rate_last_amps = Some(whole);
        self.charge_rate_last_request = now;
        events.push(SlaveEvent::SetChargeRate {
            amps,
            vin: self.current_vin.clone(),
        });
    }

    /// Start/stop decision taken before sending a protocol 2 heartbeat
    pub fn charge_control(&self, config: &CoreConfig, now: f64) -> ChargeControl {
        let actual = self.reported_amps_actual;
        if self.last_amps_offered == 0.0 && actual > 4.0 {
            if now - self.time_last_amps_offered_changed < 60.0
                || now - self.time_amps_actual_changed_significantly < config.start_stop_delay
                || actual < 4.0
            {
                ChargeControl::CancelStop
            } else {
                ChargeControl::Stop
            }
        } else if self.last_amps_offered >= config.min_amps_per_twc
            && actual < 2.0
            && self.reported_state != SlaveStatus::Error
        {
            ChargeControl::Start
        } else {
            ChargeControl::Keep
        }
    }

    // ========================================================================
    // Vehicle identification
    // ========================================================================

    /// Whether a new VIN query sequence should start now
    pub fn vin_query_due(&self, now: f64) -> bool {
        self.protocol == ProtocolVersion::V2
            && self.is_charging
            && self.current_vin.is_empty()
            && self.vin_query_attempt < VIN_MAX_ATTEMPTS
            && now - self.last_vin_query >= VIN_RETRY_SECS
    }

    pub fn mark_vin_query(&mut self, now: f64) {
        self.vin_query_attempt += 1;
        self.last_vin_query = now;
    }

    /// VIN of the car plugged in, or of the last one that charged here
    pub fn known_vin(&self) -> Option<&str> {
        [&self.current_vin, &self.last_vin]
            .into_iter()
            .find(|v| !v.is_empty())
            .map(String::as_str)
    }

    /// Record a wake request, keeping the time of the first one
    pub fn begin_wake(&mut self, now: f64) {
        if self.first_wake_attempt_time == 0.0 {
            self.first_wake_attempt_time = now;
        }
        self.last_wake_attempt = now;
    }

    /// Retry every 30 s for 10 minutes, every 5 minutes up to 70, then every 15
    pub fn wake_retry_due(&self, now: f64) -> bool {
        if self.first_wake_attempt_time == 0.0 {
            return false;
        }
        let waking_for = now - self.first_wake_attempt_time;
        let delay = if waking_for <= 10.0 * 60.0 {
            30.0
        } else if waking_for <= 70.0 * 60.0 {
            5.0 * 60.0
        } else {
            15.0 * 60.0
        };
        now - self.last_wake_attempt >= delay
    }

    pub fn woke(&mut self) {
        self.first_wake_attempt_time = 0.0;
    }

    /// Store one VIN part; the third part completes or restarts the sequence
    pub fn record_vin_part(&mut self, part: VinPart, text: &str) -> VinProgress {
        self.vin_parts[part.index()] = Some(text.to_string());
        if let Some(next) = part.next() {
            return VinProgress::Next(next);
        }

        let joined: String = self.vin_parts.iter().flatten().map(String::as_str).collect();
        self.vin_parts = [None, None, None];
        if joined.len() == 17 {
            info!("TWC {} reports VIN {}", self.id, joined);
            self.current_vin = joined.clone();
            VinProgress::Complete(joined)
        } else {
            debug!(
                "TWC {}: VIN assembled to {} characters, asking again",
                self.id,
                joined.len()
            );
            VinProgress::Restart
        }
    }

    // ========================================================================
    // Metering
    // ========================================================================

    pub fn record_voltage(&mut self, lifetime_kwh: u32, volts: [u16; 3]) {
        self.lifetime_kwh = f64::from(lifetime_kwh);
        self.volts = volts.map(f64::from);
    }

    /// Mean of the non-zero phase voltages, if any
    pub fn measured_voltage(&self) -> Option<(f64, f64)> {
        let live: Vec<f64> = self.volts.iter().copied().filter(|v| *v > 0.0).collect();
        if live.is_empty() {
            return None;
        }
        let phases = live.len() as f64;
        Some((live.iter().sum::<f64>() / phases, phases))
    }

    /// Average amps since the last sample, resetting the bucket
    pub fn take_history_sample(&mut self) -> f64 {
        let avg = self.history_avg_amps;
        self.history_avg_amps = 0.0;
        self.history_num_samples = 0;
        avg
    }

    pub fn snapshot(&self) -> SlaveSnapshot {
        SlaveSnapshot {
            twc_id: self.id.to_string(),
            protocol: self.protocol.number(),
            max_amps: self.max_amps,
            wiring_max_amps: self.wiring_max_amps,
            state: self.reported_state.code(),
            reported_amps_max: self.reported_amps_max,
            reported_amps_actual: self.reported_amps_actual,
            last_amps_offered: self.last_amps_offered,
            is_charging: self.is_charging,
            current_vin: self.current_vin.clone(),
            last_vin: self.last_vin.clone(),
            lifetime_kwh: self.lifetime_kwh,
            volts: self.volts,
            time_last_rx: self.time_last_rx,
        }
    }
}

fn status(key: &'static str, value: String, unit: &'static str) -> SlaveEvent {
    SlaveEvent::Status { key, value, unit }
}

/// Read-only view of one slave for status output
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaveSnapshot {
    pub twc_id: String,
    pub protocol: u8,
    pub max_amps: f64,
    pub wiring_max_amps: f64,
    pub state: u8,
    pub reported_amps_max: f64,
    pub reported_amps_actual: f64,
    pub last_amps_offered: f64,
    pub is_charging: bool,
    #[serde(rename = "currentVIN")]
    pub current_vin: String,
    #[serde(rename = "lastVIN")]
    pub last_vin: String,
    #[serde(rename = "lifetimekWh")]
    pub lifetime_kwh: f64,
    pub volts: [f64; 3],
    pub time_last_rx: f64,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const T0: f64 = 1_000_000.0;

    fn config() -> CoreConfig {
        CoreConfig {
            wiring_max_amps_all_twcs: 80.0,
            wiring_max_amps_per_twc: 40.0,
            min_amps_per_twc: 12.0,
            ..Default::default()
        }
    }

    fn slave(max_amps: f64, config: &CoreConfig) -> SlaveState {
        SlaveState::new(TwcId::new(0x11, 0x22), 0x77, max_amps, ProtocolVersion::V1, config, T0)
    }

    fn beat(state: SlaveStatus, max: f64, actual: f64) -> SlaveHeartbeat {
        SlaveHeartbeat::parse(&SlaveHeartbeat::encode(state, max, actual)).unwrap()
    }

    fn step(
        s: &mut SlaveState,
        hb: &SlaveHeartbeat,
        budget: f64,
        others: &[PeerLoad],
        cfg: &CoreConfig,
        now: f64,
    ) -> Vec<SlaveEvent> {
        let input = StepInput {
            heartbeat: hb,
            max_amps_to_divide: budget,
            allowed_flex: 0.0,
            green: false,
            others,
        };
        s.step(&input, cfg, now)
    }

    #[test]
    fn test_new_slave_defaults() {
        let cfg = config();
        let s = slave(80.0, &cfg);
        assert_eq!(s.spike_amps, 21.0);
        assert_eq!(s.min_amps_supported, 5.0);
        assert_eq!(s.wiring_max_amps, 40.0);
        assert_eq!(s.last_amps_offered, -1.0);

        let s = slave(32.0, &cfg);
        assert_eq!(s.spike_amps, 16.0);
        // 40A wiring on a 32A unit is unsafe
        assert_eq!(s.wiring_max_amps, 8.0);
    }

    #[test]
    fn test_first_offer_and_hold() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);

        step(&mut s, &beat(SlaveStatus::PluggedReady, 0.0, 0.0), 24.0, &[], &cfg, T0);
        assert_eq!(s.last_amps_offered, 24.0);
        assert_eq!(s.heartbeat_data.0[..3], [0x05, 0x09, 0x60]);

        // Slave echoes the offer: send idle, keep the offer
        step(&mut s, &beat(SlaveStatus::Charging, 24.0, 21.0), 24.0, &[], &cfg, T0 + 5.0);
        assert_eq!(s.last_amps_offered, 24.0);
        assert!(s.heartbeat_data.is_idle());
    }

    #[test]
    fn test_reduction_is_held_for_five_seconds() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::Charging, 0.0, 0.0), 32.0, &[], &cfg, T0);
        assert_eq!(s.last_amps_offered, 32.0);

        step(&mut s, &beat(SlaveStatus::Charging, 32.0, 30.0), 24.0, &[], &cfg, T0 + 3.0);
        assert_eq!(s.last_amps_offered, 32.0);

        step(&mut s, &beat(SlaveStatus::Charging, 32.0, 30.0), 24.0, &[], &cfg, T0 + 6.0);
        assert_eq!(s.last_amps_offered, 24.0);
    }

    #[test]
    fn test_proactive_spike() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::Charging, 12.0, 0.0), 12.0, &[], &cfg, T0);
        assert_eq!(s.last_amps_offered, 12.0);

        // Raise 12 -> 18 spikes to 21 first
        step(&mut s, &beat(SlaveStatus::Charging, 12.0, 0.0), 18.0, &[], &cfg, T0 + 6.0);
        assert_eq!(s.last_amps_offered, 21.0);

        // Spike holds while young
        step(&mut s, &beat(SlaveStatus::Charging, 21.0, 0.0), 18.0, &[], &cfg, T0 + 8.0);
        assert_eq!(s.last_amps_offered, 21.0);

        step(&mut s, &beat(SlaveStatus::Charging, 21.0, 0.0), 18.0, &[], &cfg, T0 + 12.0);
        assert_eq!(s.last_amps_offered, 18.0);
    }

    #[test]
    fn test_raise_while_pinned_spikes_first() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::Charging, 0.0, 0.0), 24.0, &[], &cfg, T0);
        step(&mut s, &beat(SlaveStatus::Charging, 24.0, 21.0), 24.0, &[], &cfg, T0 + 2.0);
        assert_eq!(s.last_amps_offered, 24.0);

        step(&mut s, &beat(SlaveStatus::Charging, 24.0, 21.0), 40.0, &[], &cfg, T0 + 6.0);
        assert_eq!(s.last_amps_offered, 21.0);

        step(&mut s, &beat(SlaveStatus::Charging, 21.0, 20.8), 40.0, &[], &cfg, T0 + 10.0);
        assert_eq!(s.last_amps_offered, 21.0);

        step(&mut s, &beat(SlaveStatus::Charging, 21.0, 20.8), 40.0, &[], &cfg, T0 + 11.0);
        assert_eq!(s.last_amps_offered, 40.0);
    }

    #[test]
    fn test_below_minimum_collapses_to_zero() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::Ready, 0.0, 0.0), 8.0, &[], &cfg, T0);
        assert_eq!(s.last_amps_offered, 0.0);
        // A zero offer is still sent as set-amps
        assert_eq!(s.heartbeat_data.0[..3], [0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_collapse_waits_out_the_hold() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::PluggedReady, 0.0, 0.0), 24.0, &[], &cfg, T0);
        assert_eq!(s.last_amps_offered, 24.0);

        step(&mut s, &beat(SlaveStatus::Charging, 24.0, 20.0), 8.0, &[], &cfg, T0 + 1.0);
        assert_eq!(s.last_amps_offered, 24.0);

        step(&mut s, &beat(SlaveStatus::Charging, 24.0, 20.0), 8.0, &[], &cfg, T0 + 6.0);
        assert_eq!(s.last_amps_offered, 0.0);
    }

    #[test]
    fn test_green_dampening_waits_out_the_hold() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        let green_step = |s: &mut SlaveState, hb: &SlaveHeartbeat, budget: f64, now: f64| {
            let input = StepInput {
                heartbeat: hb,
                max_amps_to_divide: budget,
                allowed_flex: 0.0,
                green: true,
                others: &[],
            };
            s.step(&input, &cfg, now);
        };

        green_step(&mut s, &beat(SlaveStatus::PluggedReady, 0.0, 0.0), 30.0, T0);
        assert_eq!(s.last_amps_offered, 30.0);

        // Surplus gone a second later: the offer stays until the hold ends
        green_step(&mut s, &beat(SlaveStatus::Charging, 30.0, 28.0), 0.0, T0 + 1.0);
        assert_eq!(s.last_amps_offered, 30.0);

        // then drops to the minimum while the start/stop delay runs
        green_step(&mut s, &beat(SlaveStatus::Charging, 30.0, 28.0), 0.0, T0 + 6.0);
        assert_eq!(s.last_amps_offered, s.min_amps_supported);
    }

    #[test]
    fn test_flex_starts_a_charge() {
        let mut cfg = config();
        cfg.use_flex_amps_to_start_charge = true;
        cfg.spike_amps_proactively = false;
        let mut s = slave(80.0, &cfg);
        let hb = beat(SlaveStatus::PluggedReady, 0.0, 0.0);
        let input = StepInput {
            heartbeat: &hb,
            max_amps_to_divide: 8.0,
            allowed_flex: 5.0,
            green: false,
            others: &[],
        };
        s.step(&input, &cfg, T0);
        assert_eq!(s.last_amps_offered, 12.0);
    }

    #[test]
    fn test_wiring_clamp_against_peers() {
        let mut cfg = config();
        cfg.wiring_max_amps_all_twcs = 20.0;
        let mut s = slave(80.0, &cfg);
        let others = [PeerLoad {
            amps_actual: 0.0,
            amps_offered: 20.0,
        }];
        step(&mut s, &beat(SlaveStatus::Ready, 0.0, 0.0), 30.0, &others, &cfg, T0);
        assert_eq!(s.last_amps_offered, 0.0);

        let others = [PeerLoad {
            amps_actual: 0.0,
            amps_offered: 12.0,
        }];
        step(&mut s, &beat(SlaveStatus::Ready, 0.0, 0.0), 30.0, &others, &cfg, T0 + 10.0);
        assert_eq!(s.last_amps_offered, 8.0);
    }

    #[test]
    fn test_session_edges() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        s.lifetime_kwh = 1234.0;

        let events = step(&mut s, &beat(SlaveStatus::Charging, 0.0, 16.0), 32.0, &[], &cfg, T0);
        assert!(events.contains(&SlaveEvent::Arrived));
        assert!(events.contains(&SlaveEvent::ChargingStarted { start_kwh: 1234.0 }));
        assert!(s.is_charging);

        s.current_vin = "5YJ3E1EA1JF000123".into();
        let events = step(&mut s, &beat(SlaveStatus::Ready, 32.0, 0.0), 32.0, &[], &cfg, T0 + 10.0);
        assert!(events.contains(&SlaveEvent::Departed));
        assert!(events.contains(&SlaveEvent::ChargingStopped {
            vin: Some("5YJ3E1EA1JF000123".into())
        }));
        assert_eq!(s.last_vin, "5YJ3E1EA1JF000123");
        assert!(s.current_vin.is_empty());
    }

    #[test]
    fn test_history_average() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        step(&mut s, &beat(SlaveStatus::Charging, 0.0, 10.0), 32.0, &[], &cfg, T0);
        step(&mut s, &beat(SlaveStatus::Charging, 0.0, 20.0), 32.0, &[], &cfg, T0 + 1.0);
        assert_eq!(s.take_history_sample(), 15.0);
        assert_eq!(s.history_num_samples, 0);
    }

    #[test]
    fn test_vin_assembly() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        assert_eq!(s.record_vin_part(VinPart::First, "5YJ3E1E"), VinProgress::Next(VinPart::Second));
        assert_eq!(s.record_vin_part(VinPart::Second, "A1JF000"), VinProgress::Next(VinPart::Third));
        assert_eq!(
            s.record_vin_part(VinPart::Third, "123"),
            VinProgress::Complete("5YJ3E1EA1JF000123".into())
        );
        assert_eq!(s.current_vin, "5YJ3E1EA1JF000123");

        s.record_vin_part(VinPart::First, "Tesla01");
        s.record_vin_part(VinPart::Second, "1234567");
        assert_eq!(s.record_vin_part(VinPart::Third, "890ABCD"), VinProgress::Restart);
    }

    #[test]
    fn test_vin_query_retry_window() {
        let cfg = config();
        let mut s = SlaveState::new(TwcId::new(1, 2), 0, 32.0, ProtocolVersion::V2, &cfg, T0);
        assert!(!s.vin_query_due(T0));
        s.is_charging = true;
        assert!(s.vin_query_due(T0));
        s.mark_vin_query(T0);
        assert!(!s.vin_query_due(T0 + 30.0));
        assert!(s.vin_query_due(T0 + 60.0));
        for i in 0..5 {
            s.mark_vin_query(T0 + 60.0 * f64::from(i + 1));
        }
        assert!(!s.vin_query_due(T0 + 1000.0));
    }

    #[test]
    fn test_wake_retry_schedule() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        assert_eq!(s.known_vin(), None);
        assert!(!s.wake_retry_due(T0));

        s.last_vin = "5YJ3E1EA1JF000123".into();
        assert_eq!(s.known_vin(), Some("5YJ3E1EA1JF000123"));

        s.begin_wake(T0);
        assert!(!s.wake_retry_due(T0 + 29.0));
        assert!(s.wake_retry_due(T0 + 30.0));

        // Later retries keep the first attempt time and slow down
        s.begin_wake(T0 + 700.0);
        assert_eq!(s.first_wake_attempt_time, T0);
        assert!(!s.wake_retry_due(T0 + 900.0));
        assert!(s.wake_retry_due(T0 + 1000.0));

        s.begin_wake(T0 + 4300.0);
        assert!(!s.wake_retry_due(T0 + 5000.0));
        assert!(s.wake_retry_due(T0 + 5200.0));

        // A charging car is awake
        step(&mut s, &beat(SlaveStatus::Charging, 0.0, 16.0), 32.0, &[], &cfg, T0 + 5300.0);
        assert_eq!(s.first_wake_attempt_time, 0.0);
        assert!(!s.wake_retry_due(T0 + 9000.0));
    }

    #[test]
    fn test_charge_control() {
        let cfg = config();
        let mut s = SlaveState::new(TwcId::new(1, 2), 0, 32.0, ProtocolVersion::V2, &cfg, T0);
        s.last_amps_offered = 0.0;
        s.reported_amps_actual = 16.0;
        s.time_last_amps_offered_changed = T0;
        s.time_amps_actual_changed_significantly = T0;
        assert_eq!(s.charge_control(&cfg, T0 + 30.0), ChargeControl::CancelStop);
        assert_eq!(s.charge_control(&cfg, T0 + 61.0), ChargeControl::Stop);

        s.last_amps_offered = 16.0;
        s.reported_amps_actual = 0.0;
        assert_eq!(s.charge_control(&cfg, T0), ChargeControl::Start);
        s.reported_state = SlaveStatus::Error;
        assert_eq!(s.charge_control(&cfg, T0), ChargeControl::Keep);
    }

    #[test]
    fn test_measured_voltage() {
        let cfg = config();
        let mut s = slave(80.0, &cfg);
        assert_eq!(s.measured_voltage(), None);
        s.record_voltage(5000, [240, 0, 0]);
        assert_eq!(s.measured_voltage(), Some((240.0, 1.0)));
        assert_eq!(s.lifetime_kwh, 5000.0);
    }

    #[test]
    fn test_charge_rate_requests_are_throttled() {
        let mut cfg = config();
        cfg.charge_rate_control = 2;
        let mut s = slave(80.0, &cfg);
        let hb = beat(SlaveStatus::Charging, 40.0, 20.0);

        // Nothing during the first 45 seconds after discovery
        let events = step(&mut s, &hb, 20.0, &[], &cfg, T0 + 10.0);
        assert!(!events.iter().any(|e| matches!(e, SlaveEvent::SetChargeRate { .. })));
        assert_eq!(s.last_amps_offered, 40.0);

        let events = step(&mut s, &hb, 20.0, &[], &cfg, T0 + 46.0);
        assert!(events.contains(&SlaveEvent::SetChargeRate {
            amps: 20.0,
            vin: String::new()
        }));

        let events = step(&mut s, &hb, 20.0, &[], &cfg, T0 + 50.0);
        assert!(!events.iter().any(|e| matches!(e, SlaveEvent::SetChargeRate { .. })));
    }
}
