//! Service startup helpers: banner and logging initialization

use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

const BANNER: &str = r#"
 ████████╗██╗    ██╗ ██████╗███████╗██████╗ ██╗   ██╗
 ╚══██╔══╝██║    ██║██╔════╝██╔════╝██╔══██╗██║   ██║
    ██║   ██║ █╗ ██║██║     ███████╗██████╔╝██║   ██║
    ██║   ██║███╗██║██║     ╚════██║██╔══██╗╚██╗ ██╔╝
    ██║   ╚███╔███╔╝╚██████╗███████║██║  ██║ ╚████╔╝
    ╚═╝    ╚══╝╚══╝  ╚═════╝╚══════╝╚═╝  ╚═╝  ╚═══╝
"#;

pub fn print_startup_banner(service: &ServiceInfo) {
    info!("{}", BANNER);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Options for [`init_logging`], usually filled from CLI and config
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub level: Option<String>,
    pub log_dir: Option<String>,
    /// Write a log file in addition to the console
    pub file: bool,
    pub json: bool,
    pub no_color: bool,
}

/// Initialize logging for a service
///
/// Log directory priority: `TWC_LOG_DIR`, then `options.log_dir`, then
/// `logs`. The service name becomes a subdirectory.
pub fn init_logging(service: &ServiceInfo, options: &LoggingOptions) -> anyhow::Result<()> {
    let log_dir = options
        .file
        .then(|| logging::log_root(options.log_dir.as_deref()).join(&service.name));

    let config = LogConfig {
        service_name: service.name.clone(),
        level: options.level.clone().unwrap_or_else(|| "info".to_string()),
        log_dir,
        enable_json: options.json,
        ansi: !options.no_color,
    };

    logging::init_with_config(config).map_err(|e| anyhow::anyhow!("{}", e))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_service_info_creation() {
        let service = ServiceInfo::new("twcsrv", "0.1.0", "Load sharing master");
        assert_eq!(service.name, "twcsrv");
        assert_eq!(service.version, "0.1.0");
    }
}
