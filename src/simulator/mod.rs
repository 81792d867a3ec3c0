// src/simulator/mod.rs - In-process virtual printer for tests and dry runs
pub mod axis;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::errors::{FanId, HardwareError};
use crate::exposure::PrinterContext;
use crate::hardware::{AmbientTemperature, Axis, ExposureImage, Hardware, PowerLed, ProfileSet};
use crate::project::{LayerProfile, Project, ProjectStore};

pub use axis::{AxisKind, VirtualAxis};

/// Something the virtual printer was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    TowerMove(i64),
    TiltReleased,
    TiltLayerDown,
    Stir,
    Peel {
        profile: LayerProfile,
        target_nm: i64,
        last_layer: bool,
    },
    FansStarted,
    FansStopped,
    UvPulse(u64),
    UvOn,
    UvOff,
    Blit,
    BlankArea { index: usize, last: bool },
    CoverOverride(bool),
    Beep,
    MotorsReleased,
}

/// Fault and sensor knobs.
#[derive(Debug, Clone)]
pub struct SimFaults {
    pub cover_closed: bool,
    pub uv_sensor_ok: bool,
    pub uv_overheat: bool,
    pub ambient: AmbientTemperature,
    pub failed_fans: Vec<FanId>,
    /// Volume reported by the resin sensor.
    pub resin_volume_ml: f64,
    /// Measurements returned before falling back to `resin_volume_ml`.
    pub resin_measurements: VecDeque<f64>,
    pub tower_move_fails: bool,
    pub tower_home_failures: u32,
    pub tilt_home_failures: u32,
    /// Number of upcoming peels that end with a tilt homing failure.
    pub peel_failures: u32,
    /// Lit pixels of every frame.
    pub white_pixels: u64,
}

impl Default for SimFaults {
    fn default() -> Self {
        Self {
            cover_closed: true,
            uv_sensor_ok: true,
            uv_overheat: false,
            ambient: AmbientTemperature { value: 22.0, min: 18.0, max: 35.0 },
            failed_fans: Vec::new(),
            resin_volume_ml: 150.0,
            resin_measurements: VecDeque::new(),
            tower_move_fails: false,
            tower_home_failures: 0,
            tilt_home_failures: 0,
            peel_failures: 0,
            white_pixels: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SimState {
    pub(crate) faults: SimFaults,
    events: Vec<SimEvent>,
}

impl SimState {
    pub(crate) fn record(&mut self, event: SimEvent) {
        tracing::trace!("sim: {:?}", event);
        self.events.push(event);
    }
}

#[derive(Debug, Default)]
struct UvState {
    on: bool,
    pulse_end: Option<Instant>,
    pwm: u32,
}

pub struct VirtualHardware {
    tower: Arc<VirtualAxis>,
    tilt: Arc<VirtualAxis>,
    led: Arc<PowerLed>,
    sim: Arc<Mutex<SimState>>,
    uv: Mutex<UvState>,
    fans_running: AtomicBool,
    cover_override: AtomicBool,
}

impl VirtualHardware {
    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn uv(&self) -> MutexGuard<'_, UvState> {
        self.uv.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn uv_pwm(&self) -> u32 {
        self.uv().pwm
    }

    pub fn fans_running(&self) -> bool {
        self.fans_running.load(Ordering::SeqCst)
    }

    pub fn cover_override(&self) -> bool {
        self.cover_override.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hardware for VirtualHardware {
    fn tower(&self) -> Arc<dyn Axis> {
        self.tower.clone()
    }

    fn tilt(&self) -> Arc<dyn Axis> {
        self.tilt.clone()
    }

    fn power_led(&self) -> Arc<PowerLed> {
        self.led.clone()
    }

    fn uv_led_temperature(&self) -> Result<f64, HardwareError> {
        if self.sim().faults.uv_sensor_ok {
            Ok(30.0)
        } else {
            Err(HardwareError::UvTempSensor("no reading".to_string()))
        }
    }

    fn uv_led_overheat(&self) -> bool {
        self.sim().faults.uv_overheat
    }

    fn ambient_temperature(&self) -> Result<AmbientTemperature, HardwareError> {
        Ok(self.sim().faults.ambient)
    }

    fn set_fan_auto_control(&self, fan: FanId, enabled: bool) {
        tracing::debug!("sim: fan {} auto control {}", fan, enabled);
    }

    async fn start_fans(&self) -> Result<(), HardwareError> {
        self.fans_running.store(true, Ordering::SeqCst);
        self.sim().record(SimEvent::FansStarted);
        Ok(())
    }

    async fn stop_fans(&self) -> Result<(), HardwareError> {
        self.fans_running.store(false, Ordering::SeqCst);
        self.sim().record(SimEvent::FansStopped);
        Ok(())
    }

    async fn fan_errors(&self) -> Result<Vec<FanId>, HardwareError> {
        Ok(self.sim().faults.failed_fans.clone())
    }

    async fn uv_led_on(&self) -> Result<(), HardwareError> {
        self.uv().on = true;
        self.sim().record(SimEvent::UvOn);
        Ok(())
    }

    async fn uv_led_off(&self) -> Result<(), HardwareError> {
        {
            let mut uv = self.uv();
            uv.on = false;
            uv.pulse_end = None;
        }
        self.sim().record(SimEvent::UvOff);
        Ok(())
    }

    async fn uv_led_pulse(&self, duration_ms: u64) -> Result<(), HardwareError> {
        self.uv().pulse_end = Some(Instant::now() + Duration::from_millis(duration_ms));
        self.sim().record(SimEvent::UvPulse(duration_ms));
        Ok(())
    }

    fn uv_led_pulse_remaining_ms(&self) -> u64 {
        match self.uv().pulse_end {
            Some(end) => end.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => 0,
        }
    }

    async fn set_uv_pwm(&self, pwm: u32) -> Result<(), HardwareError> {
        self.uv().pwm = pwm;
        Ok(())
    }

    async fn save_uv_usage(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn is_cover_closed(&self) -> bool {
        self.sim().faults.cover_closed
    }

    fn set_cover_override(&self, enabled: bool) {
        self.cover_override.store(enabled, Ordering::SeqCst);
        self.sim().record(SimEvent::CoverOverride(enabled));
    }

    async fn measure_resin_volume(&self) -> Result<f64, HardwareError> {
        let mut sim = self.sim();
        let volume = sim
            .faults
            .resin_measurements
            .pop_front()
            .unwrap_or(sim.faults.resin_volume_ml);
        Ok(volume)
    }

    async fn beep_alarm(&self, _count: u32) {
        self.sim().record(SimEvent::Beep);
    }

    async fn motors_stop(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn motors_release(&self) -> Result<(), HardwareError> {
        self.tower.set_synced(false);
        self.tilt.set_synced(false);
        self.sim().record(SimEvent::MotorsReleased);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ImageState {
    project_layers: usize,
    preloaded: Option<usize>,
    counting: bool,
}

pub struct VirtualExposureImage {
    sim: Arc<Mutex<SimState>>,
    state: Mutex<ImageState>,
}

impl VirtualExposureImage {
    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_counting_usage(&self) -> bool {
        self.state().counting
    }
}

#[async_trait]
impl ExposureImage for VirtualExposureImage {
    async fn new_project(&self, project: &Project) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.project_layers = project.total_layers();
        state.preloaded = None;
        Ok(())
    }

    async fn preload_image(&self, layer_index: usize) {
        let mut state = self.state();
        if layer_index < state.project_layers {
            state.preloaded = Some(layer_index);
        }
    }

    async fn sync_preloader(&self) -> Result<u64, HardwareError> {
        Ok(self.sim().faults.white_pixels)
    }

    async fn blit_image(&self) -> Result<(), HardwareError> {
        self.sim().record(SimEvent::Blit);
        Ok(())
    }

    async fn blank_screen(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn blank_area(&self, area_index: usize, last: bool) -> Result<(), HardwareError> {
        self.sim().record(SimEvent::BlankArea { index: area_index, last });
        Ok(())
    }

    async fn start_counting_usage(&self) {
        self.state().counting = true;
    }

    async fn stop_counting_usage(&self) {
        self.state().counting = false;
    }

    async fn save_display_usage(&self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Virtual hardware plus exposure surface sharing one set of knobs.
#[derive(Clone)]
pub struct VirtualPrinter {
    pub hw: Arc<VirtualHardware>,
    pub image: Arc<VirtualExposureImage>,
    sim: Arc<Mutex<SimState>>,
}

impl VirtualPrinter {
    pub fn new(config: &Config) -> Self {
        Self::with_move_time(config, Duration::ZERO)
    }

    /// Axes take `move_time` to settle after each move.
    pub fn with_move_time(config: &Config, move_time: Duration) -> Self {
        let sim = Arc::new(Mutex::new(SimState::default()));
        let tower = Arc::new(VirtualAxis::new(
            AxisKind::Tower,
            ProfileSet::from_config(&config.motion.tower),
            sim.clone(),
            move_time,
        ));
        let tilt = Arc::new(VirtualAxis::new(
            AxisKind::Tilt,
            ProfileSet::from_config(&config.motion.tilt),
            sim.clone(),
            move_time,
        ));
        let hw = Arc::new(VirtualHardware {
            tower,
            tilt,
            led: Arc::new(PowerLed::new()),
            sim: sim.clone(),
            uv: Mutex::new(UvState::default()),
            fans_running: AtomicBool::new(false),
            cover_override: AtomicBool::new(false),
        });
        let image = Arc::new(VirtualExposureImage {
            sim: sim.clone(),
            state: Mutex::new(ImageState::default()),
        });
        Self { hw, image, sim }
    }

    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn context(&self, config: Arc<Config>, store: Arc<dyn ProjectStore>) -> PrinterContext {
        PrinterContext {
            config,
            hw: self.hw.clone(),
            image: self.image.clone(),
            store,
        }
    }

    /// Adjust the fault knobs.
    pub fn with_faults<R>(&self, f: impl FnOnce(&mut SimFaults) -> R) -> R {
        f(&mut self.sim().faults)
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.sim().events.clone()
    }

    pub fn peels(&self) -> Vec<(LayerProfile, i64, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Peel { profile, target_nm, last_layer } => Some((profile, target_nm, last_layer)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_uv_pulse_counts_down() {
        let printer = VirtualPrinter::new(&Config::default());
        printer.hw.uv_led_pulse(1000).await.unwrap();
        assert_eq!(printer.hw.uv_led_pulse_remaining_ms(), 1000);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(printer.hw.uv_led_pulse_remaining_ms(), 600);
        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(printer.hw.uv_led_pulse_remaining_ms(), 0);
    }

    #[tokio::test]
    async fn test_resin_measurements_queue() {
        let printer = VirtualPrinter::new(&Config::default());
        printer.with_faults(|f| {
            f.resin_measurements = VecDeque::from([0.0, 40.0]);
            f.resin_volume_ml = 120.0;
        });
        assert_eq!(printer.hw.measure_resin_volume().await.unwrap(), 0.0);
        assert_eq!(printer.hw.measure_resin_volume().await.unwrap(), 40.0);
        assert_eq!(printer.hw.measure_resin_volume().await.unwrap(), 120.0);
    }

    #[tokio::test]
    async fn test_axis_faults() {
        let printer = VirtualPrinter::new(&Config::default());
        let tilt = printer.hw.tilt();
        printer.with_faults(|f| f.tilt_home_failures = 3);
        assert_eq!(tilt.sync_and_wait(2).await, Err(crate::errors::AxisError::TiltHomeFailed));
        tilt.sync_and_wait(2).await.unwrap();
        assert!(tilt.synced());
        assert!(tilt.set_actual_profile("nope").is_err());

        printer.with_faults(|f| f.peel_failures = 1);
        let profile = LayerProfile::fast();
        assert!(tilt.layer_peel_moves(&profile, 100, false).await.is_err());
        assert!(!tilt.synced());
        assert_eq!(printer.peels().len(), 1);
    }
}
