//! # Printer Configuration
//!
//! Hardware, resin, timing, path and motion-profile settings consumed by the
//! exposure engine. Every field has a default, so an empty file is valid.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [printer]
//! cover_check = true
//! resin_sensor = true
//! up_and_down_every_layer = 0
//!
//! [resin]
//! min_volume_ml = 68.5
//! max_volume_ml = 200.0
//!
//! [timing]
//! fan_warm_up_ms = 10000
//!
//! [motion.tilt.moveFast]
//! max_steprate = 2000
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use resin_rs::config::Config;
//! let config: Config = toml::from_str("[resin]\nlow_warn_ml = 55.0").unwrap();
//! assert_eq!(config.resin.low_warn_ml, 55.0);
//! assert!(config.validate().is_ok());
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the printer, resin tank, timings and motion profiles.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub resin: ResinConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub motion: MotionConfig,
}

/// Printer-level hardware configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_true")]
    pub calibrated: bool,
    #[serde(default = "default_uv_pwm_print")]
    pub uv_pwm_print: u32,
    #[serde(default = "default_true")]
    pub cover_check: bool,
    #[serde(default = "default_true")]
    pub resin_sensor: bool,
    #[serde(default)]
    pub fan_check_override: bool,
    #[serde(default = "default_tower_height_nm")]
    pub tower_height_nm: i64,
    #[serde(default)]
    pub calib_tower_offset_nm: i64,
    #[serde(default = "default_tower_microsteps_per_mm")]
    pub tower_microsteps_per_mm: i64,
    #[serde(default = "default_tilt_height_steps")]
    pub tilt_height_steps: i64,
    /// Zero disables the periodic up-and-down.
    #[serde(default)]
    pub up_and_down_every_layer: u32,
    #[serde(default = "default_up_and_down_wait_sec")]
    pub up_and_down_wait_sec: u32,
    #[serde(default)]
    pub up_and_down_z_offset_nm: i64,
    /// Exposure bonus after an up-and-down, in tenths of a second.
    #[serde(default)]
    pub up_and_down_expo_comp: u32,
    #[serde(default)]
    pub up_and_down_uv_on: bool,
    #[serde(default)]
    pub force_slow_tilt_height_nm: i64,
    #[serde(default = "default_stirring_delay_ms")]
    pub stirring_delay_ms: u64,
    #[serde(default = "default_pixel_size_nm")]
    pub pixel_size_nm: u64,
    #[serde(default = "default_pixels_per_percent")]
    pub pixels_per_percent: f64,
    #[serde(default = "default_refresh_delay_ms")]
    pub refresh_delay_ms: u64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            calibrated: true,
            uv_pwm_print: default_uv_pwm_print(),
            cover_check: true,
            resin_sensor: true,
            fan_check_override: false,
            tower_height_nm: default_tower_height_nm(),
            calib_tower_offset_nm: 0,
            tower_microsteps_per_mm: default_tower_microsteps_per_mm(),
            tilt_height_steps: default_tilt_height_steps(),
            up_and_down_every_layer: 0,
            up_and_down_wait_sec: default_up_and_down_wait_sec(),
            up_and_down_z_offset_nm: 0,
            up_and_down_expo_comp: 0,
            up_and_down_uv_on: false,
            force_slow_tilt_height_nm: 0,
            stirring_delay_ms: default_stirring_delay_ms(),
            pixel_size_nm: default_pixel_size_nm(),
            pixels_per_percent: default_pixels_per_percent(),
            refresh_delay_ms: default_refresh_delay_ms(),
        }
    }
}

/// Resin tank thresholds, all in ml.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResinConfig {
    #[serde(default = "default_resin_min")]
    pub min_volume_ml: f64,
    #[serde(default = "default_resin_max")]
    pub max_volume_ml: f64,
    #[serde(default = "default_resin_low_warn")]
    pub low_warn_ml: f64,
    #[serde(default = "default_resin_feed_wait")]
    pub feed_wait_ml: f64,
    #[serde(default = "default_retries")]
    pub measure_retries: u32,
}

impl Default for ResinConfig {
    fn default() -> Self {
        Self {
            min_volume_ml: default_resin_min(),
            max_volume_ml: default_resin_max(),
            low_warn_ml: default_resin_low_warn(),
            feed_wait_ml: default_resin_feed_wait(),
            measure_retries: default_retries(),
        }
    }
}

/// Polling and waiting intervals of the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_wait_tick_ms")]
    pub wait_tick_ms: u64,
    #[serde(default = "default_fan_warm_up_ms")]
    pub fan_warm_up_ms: u64,
    #[serde(default = "default_cool_down_poll_ms")]
    pub cool_down_poll_ms: u64,
    #[serde(default = "default_start_position_nm")]
    pub start_position_nm: i64,
    #[serde(default = "default_retries")]
    pub move_retries: u32,
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_tick(&self) -> Duration {
        Duration::from_millis(self.wait_tick_ms)
    }

    pub fn fan_warm_up(&self) -> Duration {
        Duration::from_millis(self.fan_warm_up_ms)
    }

    pub fn cool_down_poll(&self) -> Duration {
        Duration::from_millis(self.cool_down_poll_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_tick_ms: default_wait_tick_ms(),
            fan_warm_up_ms: default_fan_warm_up_ms(),
            cool_down_poll_ms: default_cool_down_poll_ms(),
            start_position_nm: default_start_position_nm(),
            move_retries: default_retries(),
        }
    }
}

/// Locations of files the engine reads and writes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_previous_prints")]
    pub previous_prints: PathBuf,
    #[serde(default = "default_last_project")]
    pub last_project: PathBuf,
    #[serde(default = "default_statistics")]
    pub statistics: PathBuf,
}

impl PathsConfig {
    /// All paths relocated under `root`, used by tests and the simulator.
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            previous_prints: root.join("previous-prints"),
            last_project: root.join("last_project.json"),
            statistics: root.join("statistics.toml"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            previous_prints: default_previous_prints(),
            last_project: default_last_project(),
            statistics: default_statistics(),
        }
    }
}

/// Named stepper profiles of the tilt and tower axes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_tilt_profiles")]
    pub tilt: BTreeMap<String, StepperProfileConfig>,
    #[serde(default = "default_tower_profiles")]
    pub tower: BTreeMap<String, StepperProfileConfig>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tilt: default_tilt_profiles(),
            tower: default_tower_profiles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StepperProfileConfig {
    /// Microsteps per second.
    pub max_steprate: u32,
    #[serde(default)]
    pub current: u32,
}

impl Config {
    /// Validate thresholds and profiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let resin = &self.resin;
        if resin.min_volume_ml <= 0.0 || resin.min_volume_ml >= resin.max_volume_ml {
            return Err(ConfigError::Invalid(format!(
                "resin min_volume_ml ({}) must be > 0 and below max_volume_ml ({})",
                resin.min_volume_ml, resin.max_volume_ml
            )));
        }
        if resin.feed_wait_ml > resin.low_warn_ml {
            return Err(ConfigError::Invalid(
                "resin feed_wait_ml must not exceed low_warn_ml".to_string(),
            ));
        }
        if self.printer.pixels_per_percent <= 0.0 {
            return Err(ConfigError::Invalid("pixels_per_percent must be > 0".to_string()));
        }
        if self.timing.poll_interval_ms == 0 || self.timing.wait_tick_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be > 0".to_string()));
        }
        for (axis, profiles) in [("tilt", &self.motion.tilt), ("tower", &self.motion.tower)] {
            if profiles.is_empty() {
                return Err(ConfigError::Invalid(format!("no {} profiles configured", axis)));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_uv_pwm_print() -> u32 { 208 }
fn default_tower_height_nm() -> i64 { 150_000_000 }
fn default_tower_microsteps_per_mm() -> i64 { 800 }
fn default_tilt_height_steps() -> i64 { 4_928 }
fn default_up_and_down_wait_sec() -> u32 { 10 }
fn default_stirring_delay_ms() -> u64 { 500 }
fn default_pixel_size_nm() -> u64 { 46_875 }
fn default_pixels_per_percent() -> f64 { 36_864.0 }
fn default_refresh_delay_ms() -> u64 { 4 }
fn default_resin_min() -> f64 { 68.5 }
fn default_resin_max() -> f64 { 200.0 }
fn default_resin_low_warn() -> f64 { 60.0 }
fn default_resin_feed_wait() -> f64 { 50.0 }
fn default_retries() -> u32 { 2 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_wait_tick_ms() -> u64 { 1000 }
fn default_fan_warm_up_ms() -> u64 { 10_000 }
fn default_cool_down_poll_ms() -> u64 { 3000 }
fn default_start_position_nm() -> i64 { 250_000 }
fn default_previous_prints() -> PathBuf { PathBuf::from("/var/sl1fw/previous-prints") }
fn default_last_project() -> PathBuf { PathBuf::from("/var/sl1fw/last_project.json") }
fn default_statistics() -> PathBuf { PathBuf::from("/var/sl1fw/statistics.toml") }

fn profile(max_steprate: u32, current: u32) -> StepperProfileConfig {
    StepperProfileConfig { max_steprate, current }
}

fn default_tilt_profiles() -> BTreeMap<String, StepperProfileConfig> {
    BTreeMap::from([
        ("homingFast".to_string(), profile(2200, 22)),
        ("homingSlow".to_string(), profile(1000, 22)),
        ("moveFast".to_string(), profile(2000, 22)),
        ("moveSlow".to_string(), profile(1000, 22)),
        ("layerMoveSlow".to_string(), profile(750, 40)),
        ("layerMoveFast".to_string(), profile(1500, 40)),
    ])
}

fn default_tower_profiles() -> BTreeMap<String, StepperProfileConfig> {
    BTreeMap::from([
        ("homingFast".to_string(), profile(22_000, 34)),
        ("homingSlow".to_string(), profile(2_500, 34)),
        ("moveFast".to_string(), profile(22_000, 34)),
        ("moveSlow".to_string(), profile(12_000, 34)),
        ("layer1".to_string(), profile(1_000, 34)),
        ("layer22".to_string(), profile(3_200, 34)),
    ])
}

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
