//! Configuration for the thunk runtime.
//!
//! Sources, highest precedence first:
//! 1. Environment variables
//! 2. The first configuration file found (`$RUNMAT_THUNK_CONFIG`,
//!    `.runmat-thunk.{yaml,yml,json,toml}`, `~/.config/runmat/thunk.*`)
//! 3. Built-in defaults

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ThunkInitOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThunkRuntimeConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub profiling: ProfilingConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Forward span enter/exit into the trace hook
    #[serde(default)]
    pub traces: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            traces: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilingConfig {
    /// Open a profiling span around every convolution dispatch
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Register the in-process reference runner
    #[serde(default = "default_true")]
    pub in_process: bool,
    /// Algorithm id used when a descriptor does not pick one (-1 = runner's choice)
    #[serde(default = "default_algorithm")]
    pub default_algorithm: i64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            in_process: true,
            default_algorithm: default_algorithm(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_algorithm() -> i64 {
    -1
}

impl ThunkRuntimeConfig {
    pub fn to_init_options(&self) -> ThunkInitOptions {
        ThunkInitOptions {
            register_in_process_runner: self.device.in_process,
            default_algorithm: self.device.default_algorithm,
            profiling: self.profiling.enabled,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<ThunkRuntimeConfig> {
        let mut config = Self::load_from_files()?;
        Self::apply_environment_variables(&mut config);
        Ok(config)
    }

    fn load_from_files() -> Result<ThunkRuntimeConfig> {
        for path in Self::find_config_files() {
            if path.is_dir() {
                info!(
                    "Ignoring config directory path (expected file): {}",
                    path.display()
                );
                continue;
            }
            if path.exists() {
                info!("Loading thunk configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }
        debug!("No thunk configuration file found, using defaults");
        Ok(ThunkRuntimeConfig::default())
    }

    fn find_config_files() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(config_path) = env::var("RUNMAT_THUNK_CONFIG") {
            paths.push(PathBuf::from(config_path));
        }
        if let Ok(current_dir) = env::current_dir() {
            for name in [
                ".runmat-thunk.yaml",
                ".runmat-thunk.yml",
                ".runmat-thunk.json",
                ".runmat-thunk.toml",
            ] {
                paths.push(current_dir.join(name));
            }
        }
        if let Some(home_dir) = dirs::home_dir() {
            for name in ["thunk.yaml", "thunk.json", "thunk.toml"] {
                paths.push(home_dir.join(".config/runmat").join(name));
            }
        }
        paths
    }

    pub fn load_from_file(path: &Path) -> Result<ThunkRuntimeConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => {
                if let Ok(config) = toml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_yaml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_json::from_str(&content) {
                    config
                } else {
                    return Err(anyhow::anyhow!(
                        "Could not parse config file {} (tried TOML, YAML, JSON)",
                        path.display()
                    ));
                }
            }
        };
        Ok(config)
    }

    pub fn save_to_file(config: &ThunkRuntimeConfig, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(config)
                .context("Failed to serialize config to JSON")?,
            Some("toml") => {
                toml::to_string_pretty(config).context("Failed to serialize config to TOML")?
            }
            _ => serde_yaml::to_string(config).context("Failed to serialize config to YAML")?,
        };
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    fn apply_environment_variables(config: &mut ThunkRuntimeConfig) {
        if let Ok(filter) = env::var("RUNMAT_THUNK_LOG") {
            let trimmed = filter.trim();
            if !trimmed.is_empty() {
                config.logging.filter = trimmed.to_string();
            }
        }
        if let Some(flag) = env::var("RUNMAT_THUNK_PROFILE")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            config.profiling.enabled = flag;
        }
        if let Some(flag) = env::var("RUNMAT_THUNK_INPROCESS")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            config.device.in_process = flag;
        }
        if let Ok(algorithm) = env::var("RUNMAT_THUNK_CONV_ALGORITHM") {
            if let Ok(parsed) = algorithm.trim().parse::<i64>() {
                config.device.default_algorithm = parsed;
            }
        }
    }
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn defaults() {
        let config = ThunkRuntimeConfig::default();
        assert_eq!(config.logging.filter, "info");
        assert!(config.profiling.enabled);
        assert!(config.device.in_process);
        assert_eq!(config.device.default_algorithm, -1);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let parsed: ThunkRuntimeConfig =
            serde_yaml::from_str("device:\n  default_algorithm: 3\n").unwrap();
        assert_eq!(parsed.device.default_algorithm, 3);
        assert!(parsed.device.in_process);
        assert_eq!(parsed.logging.filter, "info");
    }

    #[test]
    fn file_round_trip_for_each_format() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ThunkRuntimeConfig::default();
        config.profiling.enabled = false;
        config.device.default_algorithm = 5;

        for name in ["thunk.yaml", "thunk.json", "thunk.toml"] {
            let path = temp_dir.path().join(name);
            ConfigLoader::save_to_file(&config, &path).unwrap();
            let loaded = ConfigLoader::load_from_file(&path).unwrap();
            assert!(!loaded.profiling.enabled, "{name}");
            assert_eq!(loaded.device.default_algorithm, 5, "{name}");
        }
    }

    #[test]
    fn unknown_extension_is_auto_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("thunkrc");
        fs::write(&path, "{\"device\": {\"in_process\": false}}").unwrap();
        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert!(!loaded.device.in_process);
    }

    #[test]
    fn env_overrides_file_values() {
        let _lock = ENV_GUARD.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("thunk.yaml");
        fs::write(&path, "profiling:\n  enabled: true\n").unwrap();

        env::set_var("RUNMAT_THUNK_CONFIG", &path);
        env::set_var("RUNMAT_THUNK_PROFILE", "off");
        env::set_var("RUNMAT_THUNK_CONV_ALGORITHM", " 4 ");
        let loaded = ConfigLoader::load().unwrap();
        env::remove_var("RUNMAT_THUNK_CONFIG");
        env::remove_var("RUNMAT_THUNK_PROFILE");
        env::remove_var("RUNMAT_THUNK_CONV_ALGORITHM");

        assert!(!loaded.profiling.enabled);
        assert_eq!(loaded.device.default_algorithm, 4);
        let options = loaded.to_init_options();
        assert!(!options.profiling);
        assert_eq!(options.default_algorithm, 4);
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool(" ON "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool("  "), None);
    }

    #[test]
    fn empty_flag_keeps_the_configured_value() {
        let _lock = ENV_GUARD.lock().unwrap();
        let mut config = ThunkRuntimeConfig::default();
        env::set_var("RUNMAT_THUNK_INPROCESS", "");
        ConfigLoader::apply_environment_variables(&mut config);
        env::remove_var("RUNMAT_THUNK_INPROCESS");
        assert!(config.device.in_process);
    }
}
