use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilitySettings {
    /// Thresholds are the empirically chosen values from production use;
    /// overridable but not re-derived.
    pub p50_threshold_ms: f64,
    pub p90_threshold_ms: f64,
    pub p95_threshold_ms: f64,
    pub settle_delay_ms: u64,
    /// Packages matched (exact or substring, either direction) short-circuit
    /// to stable: launchers and system UI rarely emit usable frame stats.
    pub system_packages: Vec<String>,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            p50_threshold_ms: 100.0,
            p90_threshold_ms: 100.0,
            p95_threshold_ms: 200.0,
            settle_delay_ms: 200,
            system_packages: vec![
                "com.android.systemui".to_string(),
                "com.android.launcher".to_string(),
                "com.google.android.apps.nexuslauncher".to_string(),
                "com.android.settings".to_string(),
                "com.miui.home".to_string(),
                "com.sec.android.app.launcher".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    pub raw_dump_ttl_ms: u64,
    pub hierarchy_ttl_ms: u64,
    pub observation_ttl_ms: u64,
    pub screenshot_cache_limit_bytes: u64,
    /// Max hamming distance for perceptual screenshot-hash reuse. Exact hash
    /// matching is the baseline; 0 disables the fuzzy path.
    pub phash_max_distance: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            raw_dump_ttl_ms: 30_000,
            hierarchy_ttl_ms: 60_000,
            observation_ttl_ms: 300_000,
            screenshot_cache_limit_bytes: 128 * 1024 * 1024,
            phash_max_distance: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSettings {
    pub shell_timeout_secs: u64,
    pub hierarchy_timeout_secs: u64,
    /// Cap on captured stdout; exceeding it fails the command with
    /// ERR_OUTPUT_LIMIT, which drives the screenshot strategy fallback.
    pub output_limit_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 10,
            hierarchy_timeout_secs: 30,
            output_limit_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessibilitySettings {
    pub enabled: bool,
    pub broadcast_action: String,
    pub output_dir: String,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for AccessibilitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broadcast_action: "com.devicelens.a11y.DUMP".to_string(),
            output_dir: "/sdcard".to_string(),
            poll_interval_ms: 100,
            poll_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObserverConfig {
    #[serde(default)]
    pub stability: StabilitySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub accessibility: AccessibilitySettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVICELENS_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".devicelens_config.json")
}

pub fn load_config() -> Result<ObserverConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &ObserverConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<ObserverConfig, AppError> {
    if !path.exists() {
        return Ok(ObserverConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: ObserverConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(config: &ObserverConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: ObserverConfig) -> ObserverConfig {
    let defaults = ObserverConfig::default();
    if config.stability.p50_threshold_ms <= 0.0 {
        config.stability.p50_threshold_ms = defaults.stability.p50_threshold_ms;
    }
    if config.stability.p90_threshold_ms <= 0.0 {
        config.stability.p90_threshold_ms = defaults.stability.p90_threshold_ms;
    }
    if config.stability.p95_threshold_ms <= 0.0 {
        config.stability.p95_threshold_ms = defaults.stability.p95_threshold_ms;
    }
    if config.cache.raw_dump_ttl_ms == 0 {
        config.cache.raw_dump_ttl_ms = defaults.cache.raw_dump_ttl_ms;
    }
    if config.cache.hierarchy_ttl_ms == 0 {
        config.cache.hierarchy_ttl_ms = defaults.cache.hierarchy_ttl_ms;
    }
    if config.cache.observation_ttl_ms == 0 {
        config.cache.observation_ttl_ms = defaults.cache.observation_ttl_ms;
    }
    if config.cache.screenshot_cache_limit_bytes < 1024 * 1024 {
        config.cache.screenshot_cache_limit_bytes = defaults.cache.screenshot_cache_limit_bytes;
    }
    if config.command.shell_timeout_secs == 0 {
        config.command.shell_timeout_secs = defaults.command.shell_timeout_secs;
    }
    if config.command.hierarchy_timeout_secs == 0 {
        config.command.hierarchy_timeout_secs = defaults.command.hierarchy_timeout_secs;
    }
    if config.command.output_limit_bytes < 64 * 1024 {
        config.command.output_limit_bytes = defaults.command.output_limit_bytes;
    }
    if config.accessibility.poll_interval_ms == 0 {
        config.accessibility.poll_interval_ms = defaults.accessibility.poll_interval_ms;
    }
    if config.accessibility.poll_timeout_ms == 0 {
        config.accessibility.poll_timeout_ms = defaults.accessibility.poll_timeout_ms;
    }
    config
}
