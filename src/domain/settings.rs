use crate::infrastructure::bluetooth::connection::{ConnectionConfig, RetryPolicy};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::ScanOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    // Writes to stderr
    #[serde(default = "default_false")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "anki_vehicle_tool".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_read_uuid")]
    pub ble_read_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,

    // Connection Settings
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// Unset retries until the operator cancels
    #[serde(default)]
    pub connect_max_attempts: Option<u32>,

    // Debug Settings
    #[serde(default = "default_false")]
    pub show_advertisement_details: bool,
    #[serde(default = "default_false")]
    pub show_raw_bytes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_read_char_uuid: default_read_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            connect_max_attempts: None,
            show_advertisement_details: false,
            show_raw_bytes: false,
        }
    }
}

impl Settings {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            service_uuid: self.ble_service_uuid.clone(),
            read_char_uuid: self.ble_read_char_uuid.clone(),
            write_char_uuid: self.ble_write_char_uuid.clone(),
            retry: RetryPolicy {
                delay: Duration::from_millis(self.connect_retry_delay_ms),
                max_attempts: self.connect_max_attempts,
            },
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            show_details: self.show_advertisement_details,
            show_raw_bytes: self.show_raw_bytes,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_read_uuid() -> String {
    protocol::READ_CHAR_UUID.to_string()
}
fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}
fn default_connect_retry_delay_ms() -> u64 {
    500
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from `settings_path`, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("AnkiVehicleTool");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        let config = settings.connection_config();
        assert_eq!(config.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(config.retry.delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, None);
        assert!(!settings.log_settings.console_logging_enabled);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "connect_max_attempts": 5, "show_raw_bytes": true }"#)
                .unwrap();
        assert_eq!(settings.connect_max_attempts, Some(5));
        assert!(settings.show_raw_bytes);
        assert_eq!(settings.ble_write_char_uuid, protocol::WRITE_CHAR_UUID);
        assert_eq!(settings.log_settings.rotation, "daily");
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "anki_vehicle_tool_settings_{}.json",
            std::process::id()
        ));

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().connect_retry_delay_ms = 250;
        service.get_mut().log_settings.level = "debug".into();
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().connect_retry_delay_ms, 250);
        assert_eq!(reloaded.get().log_settings.level, "debug");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = std::env::temp_dir().join("anki_vehicle_tool_does_not_exist.json");
        let service = SettingsService::with_path(path);
        assert_eq!(service.get().connect_retry_delay_ms, 500);
    }
}
