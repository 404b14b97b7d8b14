//! Bus controller core
//!
//! Owns the slave registry, the policy engine and the outgoing frame
//! schedule. The bus task feeds it received frames, control commands and
//! clock ticks, and asks it what to transmit next. Nothing in here touches
//! the transport, so every exchange can be replayed with literal frames and
//! explicit timestamps.
//!
//! ```text
//!   Frame ──► handle_frame ──► SlaveState::step ──► events ──► tasks / sinks
//!                                     │
//!   tick ───► policy ──► budget ──────┘
//!                                     ▼
//!   next_transmission ◄── outbox, linkready, round-robin heartbeat
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, trace, warn};
use twc_policy::{Hook, PolicyAction, PolicyContext, PolicyEngine, PolicyFunction, Value};
use twc_protocol::{hex_str, random_sign, Frame, Message, ProtocolVersion, SlaveHeartbeat, TwcId, VinPart};

use crate::collaborators::{Collaborators, LoggingSink, StatusSink, VehicleApi};
use crate::config::CoreConfig;
use crate::control::ControlCommand;
use crate::green::{self, EnergyReadings};
use crate::master::{Shared, StatusSnapshot};
use crate::registry::SlaveRegistry;
use crate::settings::Settings;
use crate::slave::{ChargeControl, SlaveEvent, SlaveState, StepInput, VinProgress};
use crate::tasks::{Task, TaskQueue};

/// Linkready messages of each kind sent when we (re)announce ourselves
const LINKREADY_COUNT: u8 = 5;
/// Minimum seconds between round-robin heartbeats
const HEARTBEAT_INTERVAL_SECS: f64 = 1.0;
const LIFETIME_POLL_SECS: f64 = 120.0;
const VOLTAGE_REQUEST_MIN_SECS: f64 = 60.0;
/// A stop still drawing power after this long has not worked
const STOP_TIMEOUT_SECS: f64 = 10.0;
const HISTORY_BUCKET_SECS: f64 = 300.0;
/// Delays of the follow-up departure checks
const DEPARTURE_CHECKS_SECS: [f64; 3] = [300.0, 1200.0, 2700.0];
/// Seconds charging is paused by not answering slaves
const RESPOND_PAUSE_SECS: f64 = 60.0;
/// Same-direction start/stop requests to the vehicle API are not repeated sooner
const CHARGE_REQUEST_REPEAT_SECS: f64 = 60.0;

pub struct Core {
    config: CoreConfig,
    config_map: Map<String, JsonValue>,
    id: TwcId,
    sign: u8,
    registry: SlaveRegistry,
    policy: PolicyEngine,
    shared: Arc<Shared>,
    tasks: Arc<TaskQueue>,
    status: Arc<dyn StatusSink>,
    logging: Arc<dyn LoggingSink>,
    vehicle: Arc<dyn VehicleApi>,

    max_amps_to_divide: f64,
    allowed_flex: f64,
    last_charge_limit: Option<i32>,

    outbox: VecDeque<Frame>,
    linkready1_left: u8,
    linkready2_left: u8,
    round_robin: usize,
    last_heartbeat_tx: f64,
    last_lifetime_poll: f64,

    stop_requested_at: Option<f64>,
    stop_reported: bool,
    last_charge_request: Option<(bool, f64)>,
    history_bucket: Option<i64>,
}

impl Core {
    pub fn new(
        config: CoreConfig,
        policy: PolicyEngine,
        shared: Arc<Shared>,
        tasks: Arc<TaskQueue>,
        collaborators: &Collaborators,
    ) -> Self {
        Self::with_id(config, policy, shared, tasks, collaborators, TwcId::random(), random_sign())
    }

    /// Build with a fixed bus address
    pub fn with_id(
        config: CoreConfig,
        policy: PolicyEngine,
        shared: Arc<Shared>,
        tasks: Arc<TaskQueue>,
        collaborators: &Collaborators,
        id: TwcId,
        sign: u8,
    ) -> Self {
        info!("Master TWCID {} sign {:02X}", id, sign);
        Self {
            config_map: config.to_map(),
            config,
            id,
            sign,
            registry: SlaveRegistry::new(),
            policy,
            shared,
            tasks,
            status: collaborators.status.clone(),
            logging: collaborators.logging.clone(),
            vehicle: collaborators.vehicle.clone(),
            max_amps_to_divide: 0.0,
            allowed_flex: 0.0,
            last_charge_limit: None,
            outbox: VecDeque::new(),
            linkready1_left: LINKREADY_COUNT,
            linkready2_left: LINKREADY_COUNT,
            round_robin: 0,
            last_heartbeat_tx: 0.0,
            last_lifetime_poll: 0.0,
            stop_requested_at: None,
            stop_reported: false,
            last_charge_request: None,
            history_bucket: None,
        }
    }

    pub fn id(&self) -> TwcId {
        self.id
    }

    pub fn sign(&self) -> u8 {
        self.sign
    }

    pub fn slave(&self, id: &TwcId) -> Option<&SlaveState> {
        self.registry.lookup(id)
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn max_amps_to_divide(&self) -> f64 {
        self.max_amps_to_divide
    }

    pub fn allowed_flex(&self) -> f64 {
        self.allowed_flex
    }

    pub fn active_policy(&self) -> Option<&str> {
        self.policy.active_policy()
    }

    pub fn limit_overridden(&self) -> bool {
        self.policy.limit_overridden()
    }

    /// Set the budget all slaves share, capped at the circuit rating
    pub fn set_max_amps_to_divide(&mut self, amps: f64) {
        let mut amps = amps;
        if amps > self.config.wiring_max_amps_all_twcs {
            warn!(
                "Requested {:.2}A exceeds wiringMaxAmpsAllTWCs, using {:.2}A",
                amps, self.config.wiring_max_amps_all_twcs
            );
            amps = self.config.wiring_max_amps_all_twcs;
        }
        if amps != self.max_amps_to_divide {
            debug!("Max amps to divide {:.2}A -> {:.2}A", self.max_amps_to_divide, amps);
            self.tasks.enqueue(Task::UpdateStatus);
        }
        self.max_amps_to_divide = amps;
    }

    pub fn set_allowed_flex(&mut self, amps: f64) {
        self.allowed_flex = amps;
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Dispatch one verified frame
    pub fn handle_frame(&mut self, frame: &Frame, now: f64) {
        let message = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                debug!("Ignoring frame {}: {}", hex_str(frame.payload()), e);
                return;
            },
        };
        trace!("Received {}", message.name());

        match message {
            Message::SlaveLinkready {
                sender,
                sign,
                max_amps,
                protocol,
            } => self.on_slave_linkready(sender, sign, max_amps, protocol, now),
            Message::SlaveHeartbeat {
                sender,
                receiver,
                heartbeat,
            } => self.on_slave_heartbeat(sender, receiver, &heartbeat, now),
            Message::VoltageResponse {
                sender,
                lifetime_kwh,
                volts,
            } => self.on_voltage_response(sender, lifetime_kwh, volts, now),
            Message::VinReply { sender, part, text } => self.on_vin_reply(sender, part, &text, now),
            Message::MasterLinkready1 { sender, .. } | Message::MasterLinkready2 { sender, .. } => {
                error!(
                    "TWC {} is also acting as master; only one master is allowed per bus. \
                     Set the rotary switch of every real TWC to slave mode",
                    sender
                );
                if sender == self.id {
                    self.id_conflict();
                }
            },
            Message::MasterHeartbeat { sender, receiver, .. } => {
                if sender == self.id {
                    trace!("Ignoring echo of our own heartbeat");
                } else {
                    error!(
                        "Master {} is sending heartbeats to {}; two masters on one bus",
                        sender, receiver
                    );
                }
            },
            Message::AckStart { sender } => debug!("TWC {} acknowledged start", sender),
            Message::AckStop { sender } => debug!("TWC {} acknowledged stop", sender),
            other => debug!("Ignoring {} frame", other.name()),
        }
    }

    fn on_slave_linkready(
        &mut self,
        sender: TwcId,
        sign: u8,
        max_amps: f64,
        protocol: ProtocolVersion,
        now: f64,
    ) {
        if sender == self.id {
            self.id_conflict();
            return;
        }

        let outcome = self
            .registry
            .upsert(sender, sign, max_amps, protocol, &self.config, now);
        outcome.slave.touch(now);
        let created = outcome.created;
        let heartbeat = outcome.slave.heartbeat_data;
        if let Some(evicted) = outcome.evicted {
            self.slave_gone(&evicted, "evicted", now);
        }

        if created {
            self.status
                .set_status(&sender, "max_amps", &format!("{max_amps:.2}"), "A");
            self.status
                .set_status(&sender, "protocol", &protocol.number().to_string(), "");
        }

        // Answer right away so the slave stops announcing itself
        self.queue(Message::MasterHeartbeat {
            sender: self.id,
            receiver: sender,
            data: heartbeat.for_protocol(protocol).to_vec(),
        });
    }

    /// Close out a slave dropped from the registry
    fn slave_gone(&self, slave: &SlaveState, state: &str, now: f64) {
        self.status.set_status(&slave.id, "state", state, "");
        if slave.is_charging {
            self.logging.stop_charge_session(&slave.id, slave.lifetime_kwh, utc(now));
        }
    }

    fn on_slave_heartbeat(&mut self, sender: TwcId, receiver: TwcId, heartbeat: &SlaveHeartbeat, now: f64) {
        if receiver != self.id {
            debug!("Heartbeat from {} addressed to {}, not us", sender, receiver);
            return;
        }

        let others = self.registry.others(&sender);
        let green = self.policy.is_green();
        let input = StepInput {
            heartbeat,
            max_amps_to_divide: self.max_amps_to_divide,
            allowed_flex: self.allowed_flex,
            green,
            others: &others,
        };
        let Some(slave) = self.registry.get_mut(&sender) else {
            debug!("Heartbeat from unknown slave {}; waiting for its linkready", sender);
            return;
        };
        let events = slave.step(&input, &self.config, now);
        for event in events {
            self.on_slave_event(sender, event, now);
        }
    }

    fn on_slave_event(&mut self, twc: TwcId, event: SlaveEvent, now: f64) {
        match event {
            SlaveEvent::Status { key, value, unit } => {
                self.status.set_status(&twc, key, &value, unit);
            },
            SlaveEvent::Arrived => {
                self.tasks.enqueue(Task::CheckArrival);
                self.fire_webhook(Hook::Start);
            },
            SlaveEvent::Departed => {
                for delay in DEPARTURE_CHECKS_SECS {
                    self.tasks.enqueue_at(now + delay, Task::CheckDeparture);
                }
                self.fire_webhook(Hook::Stop);
            },
            SlaveEvent::ChargingStarted { start_kwh } => {
                self.logging.start_charge_session(&twc, start_kwh, utc(now));
                let protocol = self.registry.lookup(&twc).map(|s| s.protocol);
                if protocol == Some(ProtocolVersion::V2) {
                    if let Some(slave) = self.registry.get_mut(&twc) {
                        slave.mark_vin_query(now);
                    }
                    self.request_vin(twc, VinPart::First);
                }
            },
            SlaveEvent::ChargingStopped { vin } => {
                let lifetime = self.registry.lookup(&twc).map_or(0.0, |s| s.lifetime_kwh);
                self.logging.stop_charge_session(&twc, lifetime, utc(now));
                if let Some(vin) = vin {
                    let mut settings = self.shared.settings.lock();
                    let record = settings.vehicles.entry(vin).or_default();
                    let delivered = (lifetime - record.start_kwh).max(0.0);
                    record.total_kwh += delivered;
                    settings.kwh_delivered += delivered;
                    drop(settings);
                    self.tasks.enqueue(Task::SaveSettings);
                }
            },
            SlaveEvent::SetChargeRate { amps, vin } => {
                self.tasks.enqueue(Task::SetChargeRate { amps, vin });
            },
            SlaveEvent::WantsAmps => self.cancel_stop(),
        }
    }

    fn on_voltage_response(&mut self, sender: TwcId, lifetime_kwh: u32, volts: [u16; 3], now: f64) {
        let Some(slave) = self.registry.get_mut(&sender) else {
            debug!("Voltage response from unknown slave {}", sender);
            return;
        };
        slave.touch(now);
        slave.record_voltage(lifetime_kwh, volts);
        let (kwh, volts) = (slave.lifetime_kwh, slave.volts);

        self.status
            .set_status(&sender, "lifetime_kwh", &format!("{kwh:.0}"), "kWh");
        for (phase, v) in ["voltage_phase_a", "voltage_phase_b", "voltage_phase_c"]
            .into_iter()
            .zip(volts)
        {
            self.status.set_status(&sender, phase, &format!("{v:.0}"), "V");
        }
        self.logging.log_slave_status(&sender, kwh, volts);
    }

    fn on_vin_reply(&mut self, sender: TwcId, part: VinPart, text: &str, now: f64) {
        let Some(slave) = self.registry.get_mut(&sender) else {
            debug!("VIN reply from unknown slave {}", sender);
            return;
        };
        slave.touch(now);

        match slave.record_vin_part(part, text) {
            VinProgress::Next(next) => self.request_vin(sender, next),
            VinProgress::Complete(vin) => {
                let lifetime = slave.lifetime_kwh;
                {
                    let mut settings = self.shared.settings.lock();
                    settings
                        .slave_twcs
                        .entry(sender.to_string())
                        .or_default()
                        .supports_vin_query = 1;
                    let record = settings.vehicles.entry(vin.clone()).or_default();
                    record.charge_sessions += 1;
                    record.start_kwh = lifetime;
                }
                self.logging.update_charge_session(&sender, &vin);
                self.status.set_status(&sender, "vin", &vin, "");
                self.tasks.enqueue(Task::CheckVinEntitlement { twc: sender, vin });
                self.tasks.enqueue(Task::SaveSettings);
            },
            VinProgress::Restart => {
                if slave.vin_query_attempt < crate::slave::VIN_MAX_ATTEMPTS {
                    slave.mark_vin_query(now);
                    self.request_vin(sender, VinPart::First);
                } else {
                    warn!("Giving up on the VIN of the car on TWC {}", sender);
                }
            },
        }
    }

    /// Our address is taken: pick a new one and announce it again
    fn id_conflict(&mut self) {
        let old = self.id;
        self.id = TwcId::reroll(old);
        self.sign = random_sign();
        self.linkready1_left = LINKREADY_COUNT;
        self.linkready2_left = LINKREADY_COUNT;
        warn!("TWCID {} is already in use on the bus, switching to {}", old, self.id);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub fn handle_command(&mut self, command: ControlCommand, now: f64) {
        debug!("Handling {}", command.name());
        match command {
            ControlCommand::ChargeNow { amps, duration } => {
                {
                    let mut settings = self.shared.settings.lock();
                    settings.charge_now_amps = amps;
                    settings.charge_now_time_end = now + duration;
                }
                info!("Charge now at {:.0}A for {:.0}s", amps, duration);
                self.settings_changed(now);
            },
            ControlCommand::CancelChargeNow => {
                {
                    let mut settings = self.shared.settings.lock();
                    settings.charge_now_amps = 0.0;
                    settings.charge_now_time_end = 0.0;
                }
                info!("Charge now cancelled");
                self.settings_changed(now);
            },
            ControlCommand::SendStart => self.start_cars_charging(now),
            ControlCommand::SendStop => self.stop_cars_charging(now),
            ControlCommand::SetSetting { key, value } => {
                let result = self.shared.settings.lock().set(&key, value);
                match result {
                    Ok(()) => self.settings_changed(now),
                    Err(e) => warn!("Setting {} rejected: {}", key, e),
                }
            },
            ControlCommand::CheckArrival => {
                self.tasks.enqueue(Task::CheckArrival);
            },
            ControlCommand::CheckDeparture => {
                self.tasks.enqueue(Task::CheckDeparture);
            },
            ControlCommand::SaveSettings => {
                self.tasks.enqueue(Task::SaveSettings);
            },
            ControlCommand::GreenEnergyUpdated => {
                if self.policy.is_green() {
                    let amps = self.green_energy_amps();
                    self.set_max_amps_to_divide(amps);
                }
            },
            ControlCommand::StopTwc(twc) => {
                if self.registry.lookup(&twc).is_some() {
                    info!("Sending stop to TWC {}", twc);
                    self.queue(Message::StopCharging {
                        sender: self.id,
                        receiver: twc,
                    });
                }
            },
            ControlCommand::VehicleAwake(twc) => {
                if let Some(slave) = self.registry.get_mut(&twc) {
                    slave.woke();
                }
            },
        }
    }

    fn settings_changed(&mut self, now: f64) {
        self.tasks.enqueue(Task::SaveSettings);
        let actions = self.run_policy(now, true);
        self.apply_policy_actions(actions);
    }

    /// Stop charging according to `chargeStopMode`
    pub fn stop_cars_charging(&mut self, now: f64) {
        let mode = self.shared.settings.lock().charge_stop_mode;
        match mode {
            1 => self.request_vehicle_charge(false, now),
            2 => {
                let mut settings = self.shared.settings.lock();
                settings.respond_to_slaves = 0;
                settings.respond_to_slaves_expiry = now + RESPOND_PAUSE_SECS;
                info!("Not answering slaves for {:.0}s to stop charging", RESPOND_PAUSE_SECS);
            },
            3 => self.broadcast_stop_start(false),
            other => warn!("Unknown chargeStopMode {}", other),
        }
        if self.stop_requested_at.is_none() {
            self.stop_requested_at = Some(now);
            self.stop_reported = false;
        }
    }

    /// Start charging according to `chargeStopMode`
    pub fn start_cars_charging(&mut self, now: f64) {
        let mode = self.shared.settings.lock().charge_stop_mode;
        match mode {
            1 => {
                self.wake_vehicles(now);
                self.request_vehicle_charge(true, now);
            },
            2 => self.shared.settings.lock().respond_to_slaves = 1,
            3 => self.broadcast_stop_start(true),
            other => warn!("Unknown chargeStopMode {}", other),
        }
        self.stop_requested_at = None;
    }

    fn cancel_stop(&mut self) {
        if self.stop_requested_at.take().is_some() {
            debug!("Pending stop cancelled");
        }
    }

    fn request_vehicle_charge(&mut self, start: bool, now: f64) {
        if let Some((last, at)) = self.last_charge_request {
            if last == start && now - at < CHARGE_REQUEST_REPEAT_SECS {
                return;
            }
        }
        self.last_charge_request = Some((start, now));
        self.tasks.enqueue(Task::Charge { start });
    }

    /// Wake every car we can name so it hears the start request
    fn wake_vehicles(&mut self, now: f64) {
        let mut wakes = Vec::new();
        for slave in self.registry.all_mut() {
            if let Some(vin) = slave.known_vin().map(str::to_string) {
                slave.begin_wake(now);
                wakes.push((slave.id, vin));
            }
        }
        for (twc, vin) in wakes {
            self.tasks.enqueue(Task::Wake { twc, vin });
        }
    }

    fn poll_wakes(&mut self, now: f64) {
        let mut wakes = Vec::new();
        for slave in self.registry.all_mut() {
            if !slave.wake_retry_due(now) {
                continue;
            }
            if let Some(vin) = slave.known_vin().map(str::to_string) {
                let waking_for = now - slave.first_wake_attempt_time;
                if waking_for > crate::slave::WAKE_GIVE_UP_SECS {
                    error!(
                        "Vehicle {} on TWC {} has not woken for {:.1} hours",
                        vin,
                        slave.id,
                        waking_for / 3600.0
                    );
                }
                slave.begin_wake(now);
                wakes.push((slave.id, vin));
            } else {
                slave.woke();
            }
        }
        for (twc, vin) in wakes {
            debug!("Retrying wake of {} on TWC {}", vin, twc);
            self.tasks.enqueue(Task::Wake { twc, vin });
        }
    }

    fn broadcast_stop_start(&mut self, start: bool) {
        let ids: Vec<TwcId> = self.registry.all().iter().map(|s| s.id).collect();
        for receiver in ids {
            let message = if start {
                Message::StartCharging {
                    sender: self.id,
                    receiver,
                }
            } else {
                Message::StopCharging {
                    sender: self.id,
                    receiver,
                }
            };
            self.queue(message);
        }
    }

    // ========================================================================
    // Periodic work
    // ========================================================================

    /// Housekeeping; the bus task calls this every loop
    pub fn tick(&mut self, now: f64) {
        for slave in self.registry.evict_stale(now) {
            self.slave_gone(&slave, "timeout", now);
        }

        self.expire_settings(now);
        self.poll_vins(now);
        self.poll_wakes(now);
        self.poll_lifetime(now);
        self.check_stop_timeout(now);
        self.snap_history(now);
        self.tasks.promote_due(now);

        let actions = self.run_policy(now, false);
        self.apply_policy_actions(actions);

        *self.shared.status.write() = self.snapshot(now);
    }

    fn expire_settings(&mut self, now: f64) {
        let hour = local_time(now).hour();
        let mut changed = false;
        {
            let mut settings = self.shared.settings.lock();
            if settings.charge_now_time_end > 0.0 && settings.charge_now_time_end < now {
                info!("Charge now period has ended");
                settings.charge_now_amps = 0.0;
                settings.charge_now_time_end = 0.0;
                changed = true;
            }
            if settings.hour_resume_track_green_energy >= 0.0
                && f64::from(hour) == settings.hour_resume_track_green_energy
                && settings.non_scheduled_amps_max != -1.0
            {
                info!("Resuming green energy tracking at hour {}", hour);
                settings.non_scheduled_amps_max = -1.0;
                changed = true;
            }
        }
        if changed {
            self.settings_changed(now);
        }
    }

    fn poll_vins(&mut self, now: f64) {
        let due: Vec<TwcId> = self
            .registry
            .all_mut()
            .iter_mut()
            .filter(|s| s.vin_query_due(now))
            .map(|s| {
                s.mark_vin_query(now);
                s.id
            })
            .collect();
        for twc in due {
            debug!("Retrying VIN query on TWC {}", twc);
            self.request_vin(twc, VinPart::First);
        }
    }

    fn poll_lifetime(&mut self, now: f64) {
        if now - self.last_lifetime_poll < LIFETIME_POLL_SECS {
            return;
        }
        self.last_lifetime_poll = now;

        let due: Vec<TwcId> = self
            .registry
            .all_mut()
            .iter_mut()
            .filter(|s| {
                s.protocol == ProtocolVersion::V2
                    && now - s.last_voltage_request >= VOLTAGE_REQUEST_MIN_SECS
            })
            .map(|s| {
                s.last_voltage_request = now;
                s.id
            })
            .collect();
        for receiver in due {
            self.queue(Message::VoltageRequest {
                sender: self.id,
                receiver,
            });
        }
    }

    fn check_stop_timeout(&mut self, now: f64) {
        let Some(at) = self.stop_requested_at else {
            return;
        };
        if self.registry.total_amps_actual() < 2.0 {
            self.stop_requested_at = None;
            return;
        }
        if !self.stop_reported && now - at > STOP_TIMEOUT_SECS {
            warn!("Cars are still drawing {:.1}A 10s after a stop", self.registry.total_amps_actual());
            self.stop_reported = true;
            self.policy.override_limit();
        }
    }

    fn snap_history(&mut self, now: f64) {
        let bucket = (now / HISTORY_BUCKET_SECS).floor() as i64;
        match self.history_bucket {
            None => self.history_bucket = Some(bucket),
            Some(last) if last != bucket => {
                self.history_bucket = Some(bucket);
                let (volts, phases) = self.voltage();
                let amps: f64 = self
                    .registry
                    .all_mut()
                    .iter_mut()
                    .map(SlaveState::take_history_sample)
                    .sum();
                let watts = green::charger_load_watts(&self.config, amps, volts, phases);
                let timestamp = utc(bucket as f64 * HISTORY_BUCKET_SECS);
                self.tasks.enqueue(Task::SnapHistoryData { timestamp, watts });
            },
            Some(_) => {},
        }
    }

    fn apply_policy_actions(&mut self, actions: Vec<PolicyAction>) {
        for action in actions {
            match action {
                PolicyAction::Webhook(url) => {
                    self.tasks.enqueue(Task::Webhook { url });
                },
                PolicyAction::SetMaxAmps(amps) => self.set_max_amps_to_divide(amps),
                PolicyAction::SetAllowedFlex(flex) => self.set_allowed_flex(flex),
                PolicyAction::QueueTask(name) => match Task::from_policy_name(&name) {
                    Some(task) => {
                        self.tasks.enqueue(task);
                    },
                    None => warn!("Policy asked for unknown task {}", name),
                },
                PolicyAction::ApplyChargeLimit(limit) => {
                    if self.last_charge_limit != Some(limit) {
                        self.last_charge_limit = Some(limit);
                        self.tasks.enqueue(Task::ApplyChargeLimit(limit));
                    }
                },
            }
        }
    }

    fn fire_webhook(&mut self, hook: Hook) {
        if let Some(url) = self.policy.webhook(hook) {
            self.tasks.enqueue(Task::Webhook { url });
        }
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Next frame to put on the wire, if anything is due
    pub fn next_transmission(&mut self, now: f64) -> Option<Frame> {
        if let Some(frame) = self.outbox.pop_front() {
            return Some(frame);
        }

        if self.linkready1_left > 0 {
            self.linkready1_left -= 1;
            return self.encode(Message::MasterLinkready1 {
                sender: self.id,
                sign: self.sign,
            });
        }
        if self.linkready2_left > 0 {
            self.linkready2_left -= 1;
            return self.encode(Message::MasterLinkready2 {
                sender: self.id,
                sign: self.sign,
            });
        }

        if self.registry.is_empty() || now - self.last_heartbeat_tx < HEARTBEAT_INTERVAL_SECS {
            return None;
        }
        self.last_heartbeat_tx = now;

        {
            let mut settings = self.shared.settings.lock();
            if settings.respond_to_slaves == 0 {
                if settings.respond_to_slaves_expiry > now {
                    return None;
                }
                settings.respond_to_slaves = 1;
            }
        }

        if self.round_robin >= self.registry.len() {
            self.round_robin = 0;
        }
        let index = self.round_robin;
        self.round_robin += 1;
        let slave = self.registry.at(index)?;
        let (receiver, protocol, data) = (slave.id, slave.protocol, slave.heartbeat_data);

        if protocol == ProtocolVersion::V2 {
            match slave.charge_control(&self.config, now) {
                ChargeControl::Stop => self.stop_cars_charging(now),
                ChargeControl::CancelStop => self.cancel_stop(),
                ChargeControl::Start => self.start_cars_charging(now),
                ChargeControl::Keep => {},
            }
        }

        self.encode(Message::MasterHeartbeat {
            sender: self.id,
            receiver,
            data: data.for_protocol(protocol).to_vec(),
        })
    }

    fn request_vin(&mut self, receiver: TwcId, part: VinPart) {
        self.queue(Message::GetVin {
            sender: self.id,
            receiver,
            part,
        });
    }

    fn queue(&mut self, message: Message) {
        if let Some(frame) = self.encode(message) {
            self.outbox.push_back(frame);
        }
    }

    fn encode(&self, message: Message) -> Option<Frame> {
        match message.encode() {
            Ok(payload) => Some(Frame::from_payload(payload)),
            Err(e) => {
                error!("Not sending {}: {}", message.name(), e);
                None
            },
        }
    }

    // ========================================================================
    // Energy and status
    // ========================================================================

    /// Mains voltage and phases: slave measurement, meter, then configuration
    fn voltage(&self) -> (f64, f64) {
        let measured: Vec<(f64, f64)> = self
            .registry
            .all()
            .iter()
            .filter_map(SlaveState::measured_voltage)
            .collect();
        if !measured.is_empty() {
            let n = measured.len() as f64;
            let volts = measured.iter().map(|(v, _)| v).sum::<f64>() / n;
            let phases = measured.iter().map(|(_, p)| p).sum::<f64>() / n;
            return (volts, phases.round().max(1.0));
        }
        if let Some(voltage) = self.shared.readings.lock().voltage {
            return voltage;
        }
        (self.config.default_voltage, self.config.number_of_phases)
    }

    fn readings(&self) -> EnergyReadings {
        self.shared.readings.lock().clone()
    }

    pub fn green_energy_amps(&self) -> f64 {
        let readings = self.readings();
        let (volts, phases) = self.voltage();
        let offsets = self.shared.settings.lock().consumption_offset_watts(volts * phases);
        green::green_energy_amps(
            &self.config,
            readings.generation_w,
            readings.consumption_w + offsets,
            self.registry.total_amps_actual(),
            volts,
            phases,
        )
    }

    /// Evaluate the policy list, or only re-apply the active rule
    fn run_policy(&mut self, now: f64, immediately: bool) -> Vec<PolicyAction> {
        if !immediately && !self.policy.is_due(now) {
            return Vec::new();
        }
        let settings = self.shared.settings.lock().clone();
        let green_amps = self.green_energy_amps();
        let ctx = CoreContext {
            now,
            settings,
            config: &self.config_map,
            green_amps,
            min_battery_level: self.vehicle.min_battery_level_at_home(),
        };
        if immediately {
            self.policy.apply_immediately(&ctx)
        } else {
            self.policy.evaluate(&ctx)
        }
    }

    pub fn snapshot(&self, now: f64) -> StatusSnapshot {
        let readings = self.readings();
        let (volts, phases) = self.voltage();
        let amps_in_use = self.registry.total_amps_actual();
        StatusSnapshot {
            twc_id: self.id.to_string(),
            active_policy: self.policy.active_policy().map(str::to_string),
            green: self.policy.is_green(),
            max_amps_to_divide: self.max_amps_to_divide,
            allowed_flex: self.allowed_flex,
            amps_in_use,
            charger_load_w: green::charger_load_watts(&self.config, amps_in_use, volts, phases),
            generation_w: readings.generation_w,
            consumption_w: readings.consumption_w,
            readings_updated_at: readings.updated_at,
            last_error_at: readings.last_error_at,
            limit_overridden: self.policy.limit_overridden(),
            slaves: self.registry.all().iter().map(SlaveState::snapshot).collect(),
            updated_at: now,
        }
    }
}

/// View of the core handed to the policy engine
struct CoreContext<'a> {
    now: f64,
    settings: Settings,
    config: &'a Map<String, JsonValue>,
    green_amps: f64,
    min_battery_level: f64,
}

impl PolicyContext for CoreContext<'_> {
    fn now(&self) -> f64 {
        self.now
    }

    fn local_time(&self) -> NaiveDateTime {
        local_time(self.now)
    }

    fn setting(&self, name: &str) -> Option<Value> {
        self.settings.to_map().get(name).map(Value::from_json)
    }

    fn config(&self, name: &str) -> Option<Value> {
        self.config.get(name).map(Value::from_json)
    }

    fn call(&self, function: PolicyFunction) -> Value {
        match function {
            PolicyFunction::CheckScheduledCharging => {
                let open = green::check_scheduled_charging(&self.settings, &self.local_time());
                Value::Number(if open { 1.0 } else { 0.0 })
            },
            PolicyFunction::GreenEnergyAmps => Value::Number(self.green_amps),
        }
    }

    fn min_battery_level_at_home(&self) -> f64 {
        self.min_battery_level
    }
}

fn utc(now: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(now as i64, 0).unwrap_or_default()
}

fn local_time(now: f64) -> NaiveDateTime {
    Local
        .timestamp_opt(now as i64, 0)
        .single()
        .map(|t| t.naive_local())
        .unwrap_or_default()
}
