//! Layered configuration loading
//!
//! Defaults, then the config file (format chosen by extension), then
//! prefixed environment variables. Nested keys are joined with `__` and
//! keep their case: `TWCSRV_config__wiringMaxAmpsAllTWCs=40`.

use std::path::Path;

use errors::{config_error, TwcResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the figment for `T` without extracting it
pub fn figment_for<T: Serialize + Default>(path: Option<&Path>, env_prefix: &str) -> TwcResult<Figment> {
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| config_error!("Invalid file extension: {}", path.display()))?;

        figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(config_error!("Unsupported config format: {}", extension))
            },
        };

        if path.exists() {
            info!("Loading configuration from {}", path.display());
        } else {
            info!("Configuration file {} not found, using defaults", path.display());
        }
    } else {
        debug!("No configuration file given, using defaults");
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__").lowercase(false)))
}

/// Load `T` from defaults, an optional file and the environment
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> TwcResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(path, env_prefix)?
        .extract()
        .map_err(|e| config_error!("Failed to parse config: {}", e))
}
