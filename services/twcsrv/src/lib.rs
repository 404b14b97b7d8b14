//! Tesla Wall Connector load-sharing master (twcsrv)
//!
//! Takes the master role on an RS-485 bus of Wall Connectors set to slave
//! mode and divides one circuit's current among them. How much current the
//! circuit may carry at any moment is decided by an ordered policy list:
//! a manual "charge now", a charging schedule, surplus solar generation, or
//! a fixed fallback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  ControlHandle  │───►│    Bus task     │───►│   Transport     │
//! │  (commands)     │    │  (Core, policy) │    │ (serial / tcp)  │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │
//!                                 ▼ TaskQueue
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │     Worker      │───►│  Meters, APIs,  │
//!                        │  (slow work)    │    │  settings.json  │
//!                        └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`core`**: frame dispatch, per-slave controller, transmit schedule
//! - **`bus`**: the loop that owns the transport
//! - **`worker`**: background tasks that may block on I/O
//! - **`master`**: wiring and lifecycle

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod core;
pub mod green;
pub mod master;
pub mod registry;
pub mod settings;
pub mod slave;
pub mod tasks;
pub mod transport;
pub mod worker;

pub use config::{CoreConfig, ServiceConfig};
pub use control::{ControlCommand, ControlHandle};
pub use core::Core;
pub use master::{Master, RunningMaster, Shared, StatusSnapshot};
