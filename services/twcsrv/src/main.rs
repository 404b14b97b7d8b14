//! Tesla Wall Connector load-sharing master

use colored::Colorize;
use common::bootstrap_args::ServiceArgs;
use common::{init_logging, load_config, print_startup_banner, LoggingOptions, Parser, ServiceInfo};
use tracing::{error, info};

use twcsrv::{Master, ServiceConfig};

const ENV_PREFIX: &str = "TWCSRV_";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();

    // ============ Phase 1: Configuration ============
    let config: ServiceConfig = load_config(args.config.as_deref(), ENV_PREFIX)?;

    if args.validate {
        return validate(&config, args.no_color);
    }

    // ============ Phase 2: Logging ============
    let service_info = ServiceInfo::new(
        "twcsrv",
        env!("CARGO_PKG_VERSION"),
        "Tesla Wall Connector load-sharing master",
    );
    let level = if args.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone().unwrap_or_else(|| args.log_level.clone())
    };
    init_logging(
        &service_info,
        &LoggingOptions {
            level: Some(level),
            log_dir: config.logging.log_dir.clone(),
            file: config.logging.file,
            json: config.logging.json,
            no_color: args.no_color,
        },
    )?;
    if !args.no_color {
        print_startup_banner(&service_info);
    }

    info!(
        "Circuit {:.0}A shared by up to 3 TWCs, {:.0}A each, interface {}",
        config.config.wiring_max_amps_all_twcs,
        config.config.wiring_max_amps_per_twc,
        config.interface.type_name()
    );

    // ============ Phase 3: Start ============
    let master = Master::new(config).await?;
    let cancel = common::shutdown::shutdown_token();
    let running = master.start(cancel)?;

    // ============ Phase 4: Run until shutdown ============
    match running.join().await {
        Ok(()) => {
            info!("twcsrv stopped");
            Ok(())
        },
        Err(e) => {
            error!("twcsrv stopped with error: {} ({})", e, e.error_code());
            Err(e.into())
        },
    }
}

/// Check the merged configuration and print it
fn validate(config: &ServiceConfig, no_color: bool) -> anyhow::Result<()> {
    if no_color {
        colored::control::set_override(false);
    }
    match config.validate() {
        Ok(()) => {
            println!("{}", "Configuration is valid".green().bold());
            println!("{}", serde_yaml::to_string(config)?);
            Ok(())
        },
        Err(e) => {
            println!("{} {}", "Configuration is invalid:".red().bold(), e);
            Err(e.into())
        },
    }
}
