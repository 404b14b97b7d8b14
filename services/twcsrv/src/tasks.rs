//! Background task queue
//!
//! The bus task enqueues, a single worker drains. A task's key stays
//! claimed from enqueue until the worker reports it complete, so repeating
//! a request that is already queued or running is a no-op.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};
use twc_protocol::TwcId;

/// Slow work kept off the bus task
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Vehicle charge limit, -1 restores the previous one
    ApplyChargeLimit(i32),
    /// Ask the vehicle API to start or stop charging
    Charge { start: bool },
    CheckArrival,
    CheckDeparture,
    CheckGreenEnergy,
    CheckVinEntitlement { twc: TwcId, vin: String },
    SnapHistoryData { timestamp: DateTime<Utc>, watts: f64 },
    UpdateStatus,
    Webhook { url: String },
    SaveSettings,
    SetChargeRate { amps: f64, vin: String },
    /// Wake the car on a TWC before asking it to charge
    Wake { twc: TwcId, vin: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyChargeLimit(_) => "applyChargeLimit",
            Self::Charge { .. } => "charge",
            Self::CheckArrival => "checkArrival",
            Self::CheckDeparture => "checkDeparture",
            Self::CheckGreenEnergy => "checkGreenEnergy",
            Self::CheckVinEntitlement { .. } => "checkVINEntitlement",
            Self::SnapHistoryData { .. } => "snapHistoryData",
            Self::UpdateStatus => "updateStatus",
            Self::Webhook { .. } => "webhook",
            Self::SaveSettings => "saveSettings",
            Self::SetChargeRate { .. } => "setChargeRate",
            Self::Wake { .. } => "wake",
        }
    }

    /// Background task named by a policy rule
    pub fn from_policy_name(name: &str) -> Option<Self> {
        match name {
            "checkGreenEnergy" => Some(Self::CheckGreenEnergy),
            "checkArrival" => Some(Self::CheckArrival),
            "checkDeparture" => Some(Self::CheckDeparture),
            "updateStatus" => Some(Self::UpdateStatus),
            "saveSettings" => Some(Self::SaveSettings),
            _ => None,
        }
    }

    /// De-duplication key
    fn key(&self) -> String {
        match self {
            Self::Webhook { url } => format!("webhook:{url}"),
            Self::CheckVinEntitlement { twc, .. } => format!("checkVINEntitlement:{twc}"),
            Self::SetChargeRate { vin, .. } => format!("setChargeRate:{vin}"),
            Self::Wake { twc, .. } => format!("wake:{twc}"),
            other => other.name().to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<Task>,
    keys: HashSet<String>,
    /// Tasks waiting for their due time (epoch seconds)
    delayed: Vec<(f64, Task)>,
}

/// De-duplicating single-consumer FIFO
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task; returns false if one with the same key is pending
    pub fn enqueue(&self, task: Task) -> bool {
        let key = task.key();
        {
            let mut inner = self.inner.lock();
            if !inner.keys.insert(key) {
                trace!("Task {} already pending", task.name());
                return false;
            }
            debug!("Queued task {}", task.name());
            inner.queue.push_back(task);
        }
        self.notify.notify_one();
        true
    }

    /// Hold a task until `due`; it is de-duplicated when promoted
    pub fn enqueue_at(&self, due: f64, task: Task) {
        debug!("Scheduled task {} at {:.0}", task.name(), due);
        self.inner.lock().delayed.push((due, task));
    }

    /// Move delayed tasks whose time has come onto the queue
    pub fn promote_due(&self, now: f64) -> usize {
        let due: Vec<Task> = {
            let mut inner = self.inner.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.delayed)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            inner.delayed = waiting;
            due.into_iter().map(|(_, task)| task).collect()
        };
        due.into_iter().filter(|task| self.enqueue(task.clone())).count()
    }

    pub fn try_next(&self) -> Option<Task> {
        self.inner.lock().queue.pop_front()
    }

    /// Wait for the next task
    pub async fn next(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.try_next() {
                return task;
            }
            notified.await;
        }
    }

    /// Release the task's key after it ran
    pub fn complete(&self, task: &Task) {
        self.inner.lock().keys.remove(&task.key());
    }

    /// Take a queued task by name without running the rest
    pub fn take_pending(&self, name: &str) -> Option<Task> {
        let mut inner = self.inner.lock();
        let pos = inner.queue.iter().position(|t| t.name() == name)?;
        inner.queue.remove(pos)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.inner.lock().queue.iter().any(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delayed_len(&self) -> usize {
        self.inner.lock().delayed.len()
    }
}
