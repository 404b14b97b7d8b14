//! Logging setup shared by the TWC services
//!
//! Console output plus an optional daily-rolling log file, both using the
//! `timestamp [LEVEL] message` layout. The filter can be swapped at runtime.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log root
pub const LOG_DIR_ENV: &str = "TWC_LOG_DIR";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `2025-12-02T00:50:44.809123Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Log root: `TWC_LOG_DIR`, then the configured directory, then `logs`
pub fn log_root(config_dir: Option<&str>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config_dir.unwrap_or("logs")))
}

/// File writer that switches to a new `{YYYYMMDD}_{service}.log` at midnight
struct DailyRollingWriter {
    service_name: String,
    log_dir: PathBuf,
    current_date: Arc<Mutex<String>>,
    current_file: Arc<Mutex<File>>,
}

impl DailyRollingWriter {
    fn new(service_name: String, log_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&log_dir)?;
        let current_date = chrono::Local::now().format("%Y%m%d").to_string();
        let file = Self::open(&log_dir, &current_date, &service_name)?;
        Ok(Self {
            service_name,
            log_dir,
            current_date: Arc::new(Mutex::new(current_date)),
            current_file: Arc::new(Mutex::new(file)),
        })
    }

    fn open(dir: &std::path::Path, date: &str, service: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}_{}.log", date, service)))
    }

    fn file(&self) -> std::io::Result<std::sync::MutexGuard<'_, File>> {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let mut current_date = self
            .current_date
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;
        let mut file = self
            .current_file
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;

        if *current_date != today {
            fs::create_dir_all(&self.log_dir)?;
            *file = Self::open(&self.log_dir, &today, &self.service_name)?;
            *current_date = today;
        }
        Ok(file)
    }
}

impl Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file()?.flush()
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Write a daily log file under this directory
    pub log_dir: Option<PathBuf>,
    /// JSON lines in the log file
    pub enable_json: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Effective filter string: `RUST_LOG`, else `{level},{service}=debug`
    ///
    /// The service crate gets `debug` only while the base level is `info`.
    pub fn filter_directive(&self) -> String {
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.is_empty() {
                return env;
            }
        }
        if self.level.eq_ignore_ascii_case("info") {
            format!("info,{}=debug", self.service_name)
        } else {
            self.level.to_lowercase()
        }
    }
}

/// Install the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(config.filter_directive())?;
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = FILTER_HANDLE.set(reload_handle);

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            let writer = DailyRollingWriter::new(config.service_name.clone(), dir.clone())?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let slot = GUARD.get_or_init(|| Mutex::new(None));
            match slot.lock() {
                Ok(mut g) => *g = Some(guard),
                Err(poisoned) => *poisoned.into_inner() = Some(guard),
            }
            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::debug!("Logging: {} (console only)", config.service_name),
    }
    Ok(())
}

/// Replace the active filter, e.g. `debug` or `info,twcsrv=trace`
pub fn set_log_level(directive: &str) -> Result<(), String> {
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| "logging not initialized".to_string())?;
    let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
    handle.reload(filter).map_err(|e| e.to_string())?;
    tracing::info!("Log level changed to {}", directive);
    Ok(())
}
