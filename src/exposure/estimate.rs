// src/exposure/estimate.rs - Print time estimation from stepper timing models
use crate::config::Config;
use crate::errors::AxisError;
use crate::hardware::ProfileSet;
use crate::project::{LayerProfile, Project};

/// Motion completion is polled every 100 ms plus ~21 ms of system latency,
/// so every move is quantized to this many seconds.
const MOVE_POLL_DELAY_S: f64 = 0.121;
const TILT_RAMP_COMP: f64 = 0.1;
const TOWER_RAMP_COMP: f64 = 20_000.0;
const PROFILE_CHANGE_DELAY_MS: f64 = 20.0;
const SLEEP_DELAY_MS: f64 = 2.0;
/// Per-layer computation overhead of the exposure loop.
const LAYER_OVERHEAD_MS: i64 = 124;
/// Frames the display needs before an image is really shown.
const REFRESH_FRAMES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveAxis {
    Tilt,
    Tower,
}

/// Duration of a single move of `length` microsteps at `steprate`.
pub fn count_move_time(axis: MoveAxis, length: i64, steprate: u32) -> f64 {
    if length == 0 || steprate == 0 {
        return 0.0;
    }
    let l = length as f64;
    let rate = f64::from(steprate);
    let ticks = match axis {
        MoveAxis::Tilt => (l / (rate * MOVE_POLL_DELAY_S) + TILT_RAMP_COMP).trunc(),
        MoveAxis::Tower => (l / (rate * MOVE_POLL_DELAY_S) + (rate + l) / TOWER_RAMP_COMP).trunc(),
    };
    (ticks + 1.0) * (MOVE_POLL_DELAY_S * 1000.0)
}

/// Everything the estimator needs to know about the machine.
#[derive(Debug, Clone)]
pub struct TimingModel {
    pub tilt_height_steps: i64,
    pub tower_microsteps_per_mm: i64,
    pub refresh_delay_ms: i64,
    pub tilt: ProfileSet,
    pub tower: ProfileSet,
}

impl TimingModel {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tilt_height_steps: config.printer.tilt_height_steps,
            tower_microsteps_per_mm: config.printer.tower_microsteps_per_mm,
            refresh_delay_ms: config.printer.refresh_delay_ms as i64,
            tilt: ProfileSet::from_config(&config.motion.tilt),
            tower: ProfileSet::from_config(&config.motion.tower),
        }
    }

    fn nm_to_tower_microsteps(&self, nm: i64) -> i64 {
        nm * self.tower_microsteps_per_mm / 1_000_000
    }

    fn tilt_rate(&self, name: &str) -> Result<u32, AxisError> {
        Ok(self.tilt.get(name)?.max_steprate)
    }

    fn tilt_cycles_time(&self, cycles: u32, length: i64, profile: &str, delay_ms: u64) -> Result<f64, AxisError> {
        if cycles == 0 {
            return Ok(0.0);
        }
        let c = f64::from(cycles);
        let single = count_move_time(MoveAxis::Tilt, length / i64::from(cycles), self.tilt_rate(profile)?);
        Ok(c * single + c * (delay_ms as f64 + SLEEP_DELAY_MS))
    }

    /// Duration of the peel sequence after one layer.
    pub fn layer_peel_move_time(&self, layer_height_nm: i64, p: &LayerProfile) -> Result<i64, AxisError> {
        let mut tilt = 0.0;
        if p.use_tilt {
            tilt += PROFILE_CHANGE_DELAY_MS;
            tilt += count_move_time(
                MoveAxis::Tilt,
                p.tilt_down_offset_steps,
                self.tilt_rate(&p.tilt_down_initial_profile)?,
            );
            tilt += p.tilt_down_offset_delay_ms as f64 + SLEEP_DELAY_MS;
            tilt += PROFILE_CHANGE_DELAY_MS;
            tilt += self.tilt_cycles_time(
                p.tilt_down_cycles,
                self.tilt_height_steps - p.tilt_down_offset_steps,
                &p.tilt_down_finish_profile,
                p.tilt_down_delay_ms,
            )?;

            tilt += PROFILE_CHANGE_DELAY_MS;
            tilt += count_move_time(
                MoveAxis::Tilt,
                self.tilt_height_steps - p.tilt_up_offset_steps,
                self.tilt_rate(&p.tilt_up_initial_profile)?,
            );
            tilt += p.tilt_up_offset_delay_ms as f64 + SLEEP_DELAY_MS;
            tilt += PROFILE_CHANGE_DELAY_MS;
            tilt += self.tilt_cycles_time(
                p.tilt_up_cycles,
                p.tilt_up_offset_steps,
                &p.tilt_up_finish_profile,
                p.tilt_up_delay_ms,
            )?;
        }

        let tower_rate = self.tower.get(&p.tower_profile)?.max_steprate;
        let mut tower = 0.0;
        if p.tower_hop_height_nm != 0 {
            tower += count_move_time(
                MoveAxis::Tower,
                self.nm_to_tower_microsteps(p.tower_hop_height_nm + layer_height_nm),
                tower_rate,
            );
            tower += count_move_time(MoveAxis::Tower, self.nm_to_tower_microsteps(p.tower_hop_height_nm), tower_rate);
        } else {
            tower += count_move_time(MoveAxis::Tower, self.nm_to_tower_microsteps(layer_height_nm), tower_rate);
        }
        tower += PROFILE_CHANGE_DELAY_MS;
        tracing::debug!("layer peel time: {}", tilt + tower);
        Ok((tilt + tower) as i64)
    }

    fn layer_delays(&self, p: &LayerProfile) -> i64 {
        p.delay_before_exposure_ms as i64
            + p.delay_after_exposure_ms as i64
            + self.refresh_delay_ms * REFRESH_FRAMES
            + LAYER_OVERHEAD_MS
    }

    /// Remaining print time in ms once `layers_done` layers are printed,
    /// `slow_layers_done` of them with the slow profile.
    pub fn count_remain_time(
        &self,
        project: &Project,
        layers_done: usize,
        slow_layers_done: usize,
    ) -> Result<i64, AxisError> {
        let mut remain: i64 = project
            .layers
            .iter()
            .skip(layers_done)
            .map(|l| l.exposure_ms() as i64)
            .sum();
        let total = project.total_layers() as i64;
        let left = (total - layers_done as i64).max(0);
        let slow = (project.layers_slow as i64 - slow_layers_done as i64)
            .max(project.first_slow_layers() as i64)
            .min(total)
            .min(left);
        let fast = left - slow;

        let profile = project.exposure_profile();
        let below = &profile.below_area_fill;
        let above = &profile.above_area_fill;
        remain += fast * self.layer_peel_move_time(project.layer_height_nm, below)?;
        remain += slow * self.layer_peel_move_time(project.layer_height_nm, above)?;
        remain += fast * self.layer_delays(below);
        remain += slow * self.layer_delays(above);
        tracing::debug!("time_remain_ms: {}", remain);
        Ok(remain)
    }

    pub fn estimate_total_ms(&self, project: &Project) -> Result<i64, AxisError> {
        self.count_remain_time(project, 0, 0)
    }
}
