//! Shared building blocks for the TWC services
//!
//! - logging initialization (console + daily file, reloadable filter)
//! - layered configuration loading (figment)
//! - startup arguments, banner and shutdown signal handling

pub mod bootstrap_args;
pub mod config_loader;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use config_loader::{figment_for, load_config};
pub use service_bootstrap::{init_logging, print_startup_banner, LoggingOptions, ServiceInfo};

// Re-export common dependencies
pub use anyhow;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tokio_util;

#[cfg(feature = "cli")]
pub use clap;

#[cfg(feature = "cli")]
pub use clap::{Args, Parser, Subcommand, ValueEnum};
