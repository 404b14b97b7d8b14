//! Service assembly
//!
//! [`Master`] wires the pieces together: it loads persisted settings,
//! builds the policy engine and collaborators, then spawns the bus task
//! and the background worker. State the two tasks both need lives in
//! [`Shared`].

use std::sync::Arc;

use errors::{TwcError, TwcResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use twc_policy::PolicyEngine;
use twc_protocol::{random_sign, TwcId};

use crate::bus::BusLoop;
use crate::collaborators::Collaborators;
use crate::config::ServiceConfig;
use crate::control::ControlHandle;
use crate::core::Core;
use crate::green::EnergyReadings;
use crate::settings::{JsonSettingsStore, Settings, SettingsStore};
use crate::slave::SlaveSnapshot;
use crate::tasks::{Task, TaskQueue};
use crate::transport::{create_transport, Transport};
use crate::worker::Worker;

/// State read and written by both the bus task and the worker
#[derive(Debug, Default)]
pub struct Shared {
    pub settings: Mutex<Settings>,
    pub readings: Mutex<EnergyReadings>,
    /// Published by the bus task after every tick
    pub status: RwLock<StatusSnapshot>,
}

impl Shared {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
            ..Default::default()
        }
    }
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(rename = "twcID")]
    pub twc_id: String,
    pub active_policy: Option<String>,
    pub green: bool,
    pub max_amps_to_divide: f64,
    pub allowed_flex: f64,
    pub amps_in_use: f64,
    pub charger_load_w: f64,
    pub generation_w: f64,
    pub consumption_w: f64,
    pub readings_updated_at: f64,
    pub last_error_at: Option<f64>,
    pub limit_overridden: bool,
    pub slaves: Vec<SlaveSnapshot>,
    pub updated_at: f64,
}

/// A configured but not yet running controller
pub struct Master {
    config: ServiceConfig,
    shared: Arc<Shared>,
    tasks: Arc<TaskQueue>,
    collaborators: Collaborators,
    store: Arc<dyn SettingsStore>,
    id: Option<(TwcId, u8)>,
}

impl Master {
    /// Load settings from `settingsPath` and build the configured collaborators
    pub async fn new(config: ServiceConfig) -> TwcResult<Self> {
        config.validate()?;
        let collaborators = Collaborators::from_sources(&config.sources)?;
        let store: Arc<dyn SettingsStore> =
            Arc::new(JsonSettingsStore::new(config.config.settings_path.clone()));
        Self::with_parts(config, collaborators, store).await
    }

    pub async fn with_parts(
        config: ServiceConfig,
        collaborators: Collaborators,
        store: Arc<dyn SettingsStore>,
    ) -> TwcResult<Self> {
        let settings = store.load().await?;
        info!(
            "Settings loaded: chargeStopMode {}, nonScheduledAction {}",
            settings.charge_stop_mode, settings.non_scheduled_action
        );
        Ok(Self {
            config,
            shared: Arc::new(Shared::new(settings)),
            tasks: Arc::new(TaskQueue::new()),
            collaborators,
            store,
            id: None,
        })
    }

    /// Use a fixed bus address instead of a random one
    pub fn with_id(mut self, id: TwcId) -> Self {
        self.id = Some((id, random_sign()));
        self
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    pub fn tasks(&self) -> Arc<TaskQueue> {
        self.tasks.clone()
    }

    /// Open the configured interface and start
    pub fn start(self, cancel: CancellationToken) -> TwcResult<RunningMaster> {
        let transport = create_transport(&self.config.interface)?;
        self.start_with_transport(transport, cancel)
    }

    pub fn start_with_transport(
        self,
        transport: Box<dyn Transport>,
        cancel: CancellationToken,
    ) -> TwcResult<RunningMaster> {
        let core_config = self.config.config.clone();
        let policy = PolicyEngine::from_config(&self.config.policy, core_config.green_energy_latch())
            .map_err(|e| TwcError::Policy(e.to_string()))?;
        info!("Policy engine ready with {} rules", policy.rules().len());

        let core = match self.id {
            Some((id, sign)) => Core::with_id(
                core_config.clone(),
                policy,
                self.shared.clone(),
                self.tasks.clone(),
                &self.collaborators,
                id,
                sign,
            ),
            None => Core::new(
                core_config.clone(),
                policy,
                self.shared.clone(),
                self.tasks.clone(),
                &self.collaborators,
            ),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = ControlHandle::new(commands_tx.clone(), self.shared.clone());

        // Fresh readings before the first policy decision
        self.tasks.enqueue(Task::CheckGreenEnergy);

        let worker = Worker::new(
            core_config,
            self.shared.clone(),
            self.tasks.clone(),
            self.store.clone(),
            self.collaborators.clone(),
            commands_tx,
        )?;
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move { worker.run(worker_cancel).await });

        let bus = BusLoop::new(core, transport, commands_rx);
        let bus_cancel = cancel.clone();
        let bus = tokio::spawn(async move { bus.run(bus_cancel).await });

        Ok(RunningMaster {
            handle,
            bus,
            worker,
            cancel,
        })
    }
}

/// Handles onto the spawned tasks
pub struct RunningMaster {
    handle: ControlHandle,
    bus: JoinHandle<TwcResult<()>>,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

impl RunningMaster {
    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for both tasks; the bus result wins
    pub async fn join(self) -> TwcResult<()> {
        let bus = self.bus.await;
        // A dead bus takes the worker down with it
        self.cancel.cancel();
        if let Err(e) = self.worker.await {
            error!("Worker task failed: {}", e);
        }
        match bus {
            Ok(result) => result,
            Err(e) => Err(TwcError::Internal(format!("bus task failed: {e}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::{DummyTransport, DummyTransportConfig};
    use std::time::Duration;

    #[test]
    fn test_snapshot_wire_names() {
        let snapshot = StatusSnapshot {
            twc_id: "7777".into(),
            max_amps_to_divide: 24.0,
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["twcID"], "7777");
        assert_eq!(json["maxAmpsToDivide"], 24.0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.config.wiring_max_amps_all_twcs = 40.0;
        config.config.wiring_max_amps_per_twc = 40.0;
        config.config.settings_path = dir.path().to_string_lossy().into_owned();

        let store = Arc::new(JsonSettingsStore::new(dir.path()));
        let master = Master::with_parts(config, Collaborators::default(), store)
            .await
            .unwrap()
            .with_id(TwcId::new(0x77, 0x77));
        let shared = master.shared();

        let transport = DummyTransport::new(DummyTransportConfig::default()).unwrap();
        let running = master
            .start_with_transport(Box::new(transport), CancellationToken::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(running.handle().status().twc_id, "7777");
        assert_eq!(shared.status.read().slaves.len(), 1);

        running.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running.join())
            .await
            .unwrap()
            .unwrap();
    }
}
