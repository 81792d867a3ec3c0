// src/hardware/mod.rs - Interfaces of the printer hardware the exposure engine drives
pub mod power_led;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::StepperProfileConfig;
use crate::errors::{AxisError, FanId, HardwareError};
use crate::project::{LayerProfile, Project};

pub use power_led::{IndicatorGuard, PowerLed, PowerLedMode};

/// A named bundle of stepper driver parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    pub name: String,
    /// Microsteps per second.
    pub max_steprate: u32,
    pub current: u32,
}

/// The named profiles an axis can be switched to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<String, MotionProfile>,
}

impl ProfileSet {
    pub fn from_config(profiles: &BTreeMap<String, StepperProfileConfig>) -> Self {
        let profiles = profiles
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    MotionProfile {
                        name: name.clone(),
                        max_steprate: cfg.max_steprate,
                        current: cfg.current,
                    },
                )
            })
            .collect();
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Result<&MotionProfile, AxisError> {
        self.profiles
            .get(name)
            .ok_or_else(|| AxisError::UnknownProfile(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

/// One motion axis (tower or tilt) as exposed by the motion controller.
///
/// All `*_and_wait` operations retry internally and report a home/move failure
/// only after the retry budget is exhausted.
#[async_trait]
pub trait Axis: Send + Sync {
    fn name(&self) -> &str;
    fn profiles(&self) -> &ProfileSet;
    fn actual_profile(&self) -> String;
    fn set_actual_profile(&self, name: &str) -> Result<(), AxisError>;
    /// Homing status: true once the axis has a trusted reference position.
    fn synced(&self) -> bool;
    fn position(&self) -> i64;

    async fn move_to(&self, position: i64) -> Result<(), AxisError>;
    async fn move_and_wait(&self, position: i64, retries: u32) -> Result<(), AxisError>;
    async fn sync_and_wait(&self, retries: u32) -> Result<(), AxisError>;
    async fn wait_to_stop(&self) -> Result<(), AxisError>;
    async fn release(&self) -> Result<(), AxisError>;

    /// Peel the cured layer and move the tower to `target_position_nm`.
    /// On the last layer only the lowering part is performed.
    async fn layer_peel_moves(
        &self,
        profile: &LayerProfile,
        target_position_nm: i64,
        last_layer: bool,
    ) -> Result<(), AxisError>;
    async fn stir_resin(&self, profile: &LayerProfile) -> Result<(), AxisError>;
    async fn layer_down_wait(&self, profile: &LayerProfile) -> Result<(), AxisError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientTemperature {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Facade over fans, UV source, sensors and the motion axes.
#[async_trait]
pub trait Hardware: Send + Sync {
    fn tower(&self) -> Arc<dyn Axis>;
    fn tilt(&self) -> Arc<dyn Axis>;
    fn power_led(&self) -> Arc<PowerLed>;

    fn uv_led_temperature(&self) -> Result<f64, HardwareError>;
    fn uv_led_overheat(&self) -> bool;
    fn ambient_temperature(&self) -> Result<AmbientTemperature, HardwareError>;

    fn set_fan_auto_control(&self, fan: FanId, enabled: bool);
    async fn start_fans(&self) -> Result<(), HardwareError>;
    async fn stop_fans(&self) -> Result<(), HardwareError>;
    /// Fans currently reporting an error, refreshed from the motion controller.
    async fn fan_errors(&self) -> Result<Vec<FanId>, HardwareError>;

    async fn uv_led_on(&self) -> Result<(), HardwareError>;
    async fn uv_led_off(&self) -> Result<(), HardwareError>;
    async fn uv_led_pulse(&self, duration_ms: u64) -> Result<(), HardwareError>;
    fn uv_led_pulse_remaining_ms(&self) -> u64;
    async fn set_uv_pwm(&self, pwm: u32) -> Result<(), HardwareError>;
    async fn save_uv_usage(&self) -> Result<(), HardwareError>;

    fn is_cover_closed(&self) -> bool;
    fn set_cover_override(&self, enabled: bool);

    /// Measured resin volume in ml; zero means the measurement failed.
    async fn measure_resin_volume(&self) -> Result<f64, HardwareError>;
    async fn beep_alarm(&self, count: u32);

    async fn motors_stop(&self) -> Result<(), HardwareError>;
    async fn motors_release(&self) -> Result<(), HardwareError>;
}

/// The exposure surface compositor.
#[async_trait]
pub trait ExposureImage: Send + Sync {
    async fn new_project(&self, project: &Project) -> Result<(), HardwareError>;
    /// Loads the layer image in the background; a no-op past the last layer.
    async fn preload_image(&self, layer_index: usize);
    /// Waits for the preloaded image and returns its lit pixel count.
    async fn sync_preloader(&self) -> Result<u64, HardwareError>;
    async fn blit_image(&self) -> Result<(), HardwareError>;
    async fn blank_screen(&self) -> Result<(), HardwareError>;
    /// Blanks one calibration region of the current frame.
    async fn blank_area(&self, area_index: usize, last: bool) -> Result<(), HardwareError>;
    async fn start_counting_usage(&self);
    async fn stop_counting_usage(&self);
    async fn save_display_usage(&self) -> Result<(), HardwareError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;

    #[test]
    fn test_profile_set_lookup() {
        let profiles = ProfileSet::from_config(&MotionConfig::default().tilt);
        assert_eq!(profiles.get("moveFast").unwrap().max_steprate, 2000);
        assert!(profiles.contains("layerMoveSlow"));
        assert_eq!(
            profiles.get("warp").unwrap_err(),
            AxisError::UnknownProfile("warp".to_string())
        );
        assert!(profiles.names().any(|n| n == "homingFast"));
    }
}
