//! Background worker
//!
//! Drains the task queue one task at a time: meter polls, webhooks,
//! vehicle API calls and settings persistence. Anything it learns that the
//! bus task must act on goes back as a [`ControlCommand`].

use std::sync::Arc;
use std::time::Duration;

use errors::{TwcError, TwcResult};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::now_secs;
use crate::collaborators::{Backoff, Collaborators, MeterReading, VehicleApi};
use crate::config::CoreConfig;
use crate::control::ControlCommand;
use crate::master::Shared;
use crate::settings::SettingsStore;
use crate::tasks::{Task, TaskQueue};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Worker {
    config: CoreConfig,
    shared: Arc<Shared>,
    tasks: Arc<TaskQueue>,
    store: Arc<dyn SettingsStore>,
    collaborators: Collaborators,
    commands: mpsc::UnboundedSender<ControlCommand>,
    http: Client,
    meter_backoff: Vec<Backoff>,
    /// Last good reading per meter, kept through failures and backoff
    meter_cache: Vec<Option<MeterReading>>,
    vehicle_backoff: Backoff,
    /// Charge limit most recently sent to the vehicle API
    last_limit: i32,
}

impl Worker {
    pub fn new(
        config: CoreConfig,
        shared: Arc<Shared>,
        tasks: Arc<TaskQueue>,
        store: Arc<dyn SettingsStore>,
        collaborators: Collaborators,
        commands: mpsc::UnboundedSender<ControlCommand>,
    ) -> TwcResult<Self> {
        let http = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| TwcError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            meter_backoff: vec![Backoff::default(); collaborators.meters.len()],
            meter_cache: vec![None; collaborators.meters.len()],
            config,
            shared,
            tasks,
            store,
            collaborators,
            commands,
            http,
            vehicle_backoff: Backoff::default(),
            last_limit: -1,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Worker started");
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.tasks.next() => task,
            };
            self.execute(&task).await;
            self.tasks.complete(&task);
        }

        // Settings changed just before shutdown must not be lost
        if self.tasks.take_pending("saveSettings").is_some() {
            if let Err(e) = self.save_settings().await {
                error!("Final settings save failed: {}", e);
            }
        }
        info!("Worker stopped");
    }

    /// Run one task, logging instead of propagating failures
    pub async fn execute(&mut self, task: &Task) {
        debug!("Running task {}", task.name());
        if let Err(e) = self.run_task(task).await {
            warn!("Task {} failed: {} ({})", task.name(), e, e.error_code());
        }
    }

    async fn run_task(&mut self, task: &Task) -> TwcResult<()> {
        match task {
            Task::ApplyChargeLimit(limit) => {
                self.last_limit = *limit;
                self.vehicle_call(|v| async move { v.apply_charge_limit(*limit, false, false).await })
                    .await
            },
            Task::Charge { start } => {
                let start = *start;
                self.vehicle_call(|v| async move {
                    if start {
                        v.start_charge(None).await
                    } else {
                        v.stop_charge(None).await
                    }
                })
                .await
            },
            Task::CheckArrival => {
                let limit = self.last_limit;
                self.vehicle_call(|v| async move { v.apply_charge_limit(limit, true, false).await })
                    .await
            },
            Task::CheckDeparture => {
                let limit = self.last_limit;
                self.vehicle_call(|v| async move { v.apply_charge_limit(limit, false, true).await })
                    .await
            },
            Task::CheckGreenEnergy => {
                self.poll_meters().await;
                self.notify(ControlCommand::GreenEnergyUpdated)
            },
            Task::CheckVinEntitlement { twc, vin } => {
                let allowed = self.shared.settings.lock().vin_allowed(vin);
                if allowed {
                    debug!("Vehicle {} may charge on TWC {}", vin, twc);
                    Ok(())
                } else {
                    warn!("Vehicle {} is not authorized to charge; stopping TWC {}", vin, twc);
                    self.notify(ControlCommand::StopTwc(*twc))
                }
            },
            Task::SnapHistoryData { timestamp, watts } => {
                self.shared.settings.lock().push_history(*timestamp, *watts);
                self.save_settings().await
            },
            Task::UpdateStatus => {
                let status = self.shared.status.read().clone();
                if status.green {
                    self.collaborators.logging.log_green_energy(
                        status.generation_w,
                        status.consumption_w,
                        status.charger_load_w,
                    );
                }
                Ok(())
            },
            Task::Webhook { url } => self.webhook(url).await,
            Task::SaveSettings => self.save_settings().await,
            Task::Wake { twc, vin } => {
                if !self.vehicle_backoff.ready(now_secs()) {
                    debug!("Vehicle API backing off, wake of {} retried later", vin);
                    return Ok(());
                }
                let name = vin.clone();
                self.vehicle_call(|v| async move { v.wake(&name).await })
                    .await?;
                info!("Vehicle {} on TWC {} is awake", vin, twc);
                self.notify(ControlCommand::VehicleAwake(*twc))
            },
            Task::SetChargeRate { amps, vin } => {
                let amps = *amps;
                let vin = vin.clone();
                self.vehicle_call(|v| async move { v.set_charge_rate(&vin, amps).await })
                    .await
            },
        }
    }

    /// Poll every meter that is not backing off and sum the last good readings
    async fn poll_meters(&mut self) {
        let now = now_secs();
        let mut failed = false;

        let meters = self.collaborators.meters.iter();
        for ((meter, backoff), cached) in meters
            .zip(&mut self.meter_backoff)
            .zip(&mut self.meter_cache)
        {
            if !backoff.ready(now) {
                debug!("Meter {} backing off", meter.name());
                continue;
            }
            match meter.read().await {
                Ok(reading) => {
                    backoff.success();
                    *cached = Some(reading);
                },
                Err(e) => {
                    warn!("Meter {} failed, keeping its last reading: {}", meter.name(), e);
                    backoff.failure(now);
                    failed = true;
                },
            }
        }

        let known = self.meter_cache.iter().flatten();
        let generation: f64 = known.clone().map(|r| r.generation_w).sum();
        let consumption: f64 = known.clone().map(|r| r.consumption_w).sum();
        let voltage = known.filter_map(|r| r.voltage).next();

        let mut readings = self.shared.readings.lock();
        readings.generation_w = generation;
        readings.consumption_w = consumption;
        readings.voltage = voltage;
        readings.updated_at = now;
        if failed {
            readings.last_error_at = Some(now);
        }
        debug!("Green energy: generation {:.0}W, consumption {:.0}W", generation, consumption);
    }

    async fn webhook(&self, url: &str) -> TwcResult<()> {
        let status = self.shared.status.read().clone();
        let request = if self.config.webhook_method.eq_ignore_ascii_case("GET") {
            self.http.get(url)
        } else {
            self.http.post(url).json(&status)
        };
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TwcError::collaborator(
                "webhook",
                format!("{url} answered {}", response.status()),
            ));
        }
        info!("Webhook {} delivered", url);
        Ok(())
    }

    async fn save_settings(&self) -> TwcResult<()> {
        let settings = self.shared.settings.lock().clone();
        self.store.save(&settings).await
    }

    async fn vehicle_call<F, Fut>(&mut self, call: F) -> TwcResult<()>
    where
        F: FnOnce(Arc<dyn VehicleApi>) -> Fut,
        Fut: std::future::Future<Output = TwcResult<()>>,
    {
        let now = now_secs();
        if !self.vehicle_backoff.ready(now) {
            debug!("Vehicle API backing off");
            return Ok(());
        }
        match call(self.collaborators.vehicle.clone()).await {
            Ok(()) => {
                self.vehicle_backoff.success();
                Ok(())
            },
            Err(e) => {
                self.vehicle_backoff.failure(now);
                Err(e)
            },
        }
    }

    fn notify(&self, command: ControlCommand) -> TwcResult<()> {
        self.commands
            .send(command)
            .map_err(|_| TwcError::Internal("bus task is gone".to_string()))
    }
}
