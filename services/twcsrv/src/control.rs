//! Control surface
//!
//! [`ControlHandle`] is what a front end (HTTP, MQTT, a test) holds. Every
//! command goes onto the bus task's channel; status is read from the
//! snapshot the bus task publishes after each tick.

use std::sync::Arc;

use errors::{TwcError, TwcResult};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;
use twc_protocol::TwcId;

use crate::master::{Shared, StatusSnapshot};

/// Commands handled on the bus task
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Charge at `amps` for `duration` seconds regardless of policy
    ChargeNow { amps: f64, duration: f64 },
    CancelChargeNow,
    SendStart,
    SendStop,
    SetSetting { key: String, value: JsonValue },
    CheckArrival,
    CheckDeparture,
    SaveSettings,
    /// Worker finished polling energy meters
    GreenEnergyUpdated,
    /// Send a stop command to one slave
    StopTwc(TwcId),
    /// The car on a TWC answered a wake request
    VehicleAwake(TwcId),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChargeNow { .. } => "chargeNow",
            Self::CancelChargeNow => "cancelChargeNow",
            Self::SendStart => "sendStart",
            Self::SendStop => "sendStop",
            Self::SetSetting { .. } => "setSetting",
            Self::CheckArrival => "checkArrival",
            Self::CheckDeparture => "checkDeparture",
            Self::SaveSettings => "saveSettings",
            Self::GreenEnergyUpdated => "greenEnergyUpdated",
            Self::StopTwc(_) => "stopTWC",
            Self::VehicleAwake(_) => "vehicleAwake",
        }
    }
}

/// Cloneable handle onto a running controller
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn new(commands: mpsc::UnboundedSender<ControlCommand>, shared: Arc<Shared>) -> Self {
        Self { commands, shared }
    }

    pub fn send(&self, command: ControlCommand) -> TwcResult<()> {
        debug!("Control command {}", command.name());
        self.commands
            .send(command)
            .map_err(|_| TwcError::Internal("controller is not running".to_string()))
    }

    pub fn charge_now(&self, amps: f64, duration_secs: f64) -> TwcResult<()> {
        if amps <= 0.0 || duration_secs <= 0.0 {
            return Err(TwcError::InvalidConfig {
                field: "chargeNow".to_string(),
                reason: "amps and duration must be positive".to_string(),
            });
        }
        self.send(ControlCommand::ChargeNow {
            amps,
            duration: duration_secs,
        })
    }

    pub fn cancel_charge_now(&self) -> TwcResult<()> {
        self.send(ControlCommand::CancelChargeNow)
    }

    pub fn send_start(&self) -> TwcResult<()> {
        self.send(ControlCommand::SendStart)
    }

    pub fn send_stop(&self) -> TwcResult<()> {
        self.send(ControlCommand::SendStop)
    }

    /// Change one setting; the value is checked before it is queued
    pub fn set_setting(&self, key: &str, value: JsonValue) -> TwcResult<()> {
        let mut candidate = self.shared.settings.lock().clone();
        candidate.set(key, value.clone())?;
        self.send(ControlCommand::SetSetting {
            key: key.to_string(),
            value,
        })
    }

    pub fn check_arrival(&self) -> TwcResult<()> {
        self.send(ControlCommand::CheckArrival)
    }

    pub fn check_departure(&self) -> TwcResult<()> {
        self.send(ControlCommand::CheckDeparture)
    }

    pub fn save_settings(&self) -> TwcResult<()> {
        self.send(ControlCommand::SaveSettings)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.shared.status.read().clone()
    }
}
