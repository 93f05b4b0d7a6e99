use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::adb::paths::validate_device_path;
use crate::app::error::AppError;

pub const DEFAULT_DEVICE_DIR: &str = "/data/local/tmp/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdbSettings {
    pub command_path: String,
    pub serial: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    pub local_port: u16,
    pub device_port: u16,
    pub start_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub device_dir: String,
    pub libs_dir: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            local_port: 9008,
            device_port: 9008,
            start_timeout_ms: 5000,
            poll_interval_ms: 100,
            request_timeout_ms: 30_000,
            device_dir: DEFAULT_DEVICE_DIR.to_string(),
            libs_dir: "libs".to_string(),
        }
    }
}

impl ServerSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchSettings {
    pub default_timeout_ms: u64,
    // 0 disables the stall phase.
    pub default_stall_ms: u64,
    pub clear_log_on_start: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 15_000,
            default_stall_ms: 0,
            clear_log_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiSettings {
    pub wait_for_element_timeout_ms: u64,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            wait_for_element_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureSettings {
    pub save_data_on_failure: bool,
    pub failed_data_dir: String,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            save_data_on_failure: false,
            failed_data_dir: "/tmp/magneto_test_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MagnetoConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(default)]
    pub failure: FailureSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for MagnetoConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            server: ServerSettings::default(),
            watch: WatchSettings::default(),
            ui: UiSettings::default(),
            failure: FailureSettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MAGNETO_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    home_dir().join(".magneto_config.json")
}

pub fn backup_config_path() -> PathBuf {
    home_dir().join(".magneto_config.backup.json")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_config() -> Result<MagnetoConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &MagnetoConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<MagnetoConfig, AppError> {
    if !path.exists() {
        return Ok(apply_env_overrides(MagnetoConfig::default()));
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: MagnetoConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(apply_env_overrides(config)))
}

pub fn save_config_to_path(
    config: &MagnetoConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn apply_env_overrides(config: MagnetoConfig) -> MagnetoConfig {
    let serial = std::env::var("ANDROID_SERIAL").ok();
    apply_serial_fallback(config, serial.as_deref())
}

fn apply_serial_fallback(mut config: MagnetoConfig, env_serial: Option<&str>) -> MagnetoConfig {
    if config.adb.serial.trim().is_empty() {
        if let Some(serial) = env_serial.map(str::trim).filter(|value| !value.is_empty()) {
            config.adb.serial = serial.to_string();
        }
    }
    config
}

pub fn validate_config(mut config: MagnetoConfig) -> MagnetoConfig {
    let defaults = ServerSettings::default();
    if config.server.local_port == 0 {
        config.server.local_port = defaults.local_port;
    }
    if config.server.device_port == 0 {
        config.server.device_port = defaults.device_port;
    }
    if config.server.start_timeout_ms == 0 {
        config.server.start_timeout_ms = defaults.start_timeout_ms;
    }
    if config.server.poll_interval_ms < 10 {
        config.server.poll_interval_ms = defaults.poll_interval_ms;
    }
    if config.server.request_timeout_ms < 100 {
        config.server.request_timeout_ms = defaults.request_timeout_ms;
    }
    if validate_device_path(&config.server.device_dir).is_err() {
        config.server.device_dir = defaults.device_dir;
    }
    if !config.server.device_dir.ends_with('/') {
        config.server.device_dir.push('/');
    }
    if config.watch.default_timeout_ms == 0 {
        config.watch.default_timeout_ms = 15_000;
    }
    if config.ui.wait_for_element_timeout_ms == 0 {
        config.ui.wait_for_element_timeout_ms = 5000;
    }
    if config.failure.failed_data_dir.trim().is_empty() {
        config.failure.failed_data_dir = FailureSettings::default().failed_data_dir;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = "INFO".to_string();
    }
    config
}
