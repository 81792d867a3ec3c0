// src/exposure/checks.rs - Pre-print check runners and the check pipeline
use std::path::Path;
use std::sync::Mutex;

use super::CancelToken;
use super::data::JobState;
use super::gate::WarningGate;
use super::resin::ResinAccountant;
use crate::config::Config;
use crate::errors::{AxisError, ExposureError, FanId, HardwareError, PrinterWarning};
use crate::hardware::{ExposureImage, Hardware};
use crate::project::ProjectStore;
use crate::state::{ExposureCheck, ExposureCheckResult, ExposureState};

/// Everything a check may touch. Borrowed from the worker for the
/// duration of the `CHECKS` state.
pub struct CheckContext<'a> {
    pub job: &'a JobState,
    pub hw: &'a dyn Hardware,
    pub image: &'a dyn ExposureImage,
    pub store: &'a dyn ProjectStore,
    pub config: &'a Config,
    pub gate: &'a WarningGate,
    pub resin: &'a Mutex<ResinAccountant>,
    pub cancel: CancelToken,
}

impl CheckContext<'_> {
    async fn warn(&self, warning: PrinterWarning) -> Result<ExposureCheckResult, ExposureError> {
        self.gate.raise(self.job, warning, &self.cancel).await?;
        Ok(ExposureCheckResult::Warning)
    }
}

/// The six pre-print checks in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRunner {
    Fans,
    Temperature,
    ProjectData,
    Cover,
    Resin,
    StartPositions,
    Stirring,
}

impl CheckRunner {
    pub const SEQUENTIAL: [CheckRunner; 4] =
        [CheckRunner::Cover, CheckRunner::Resin, CheckRunner::StartPositions, CheckRunner::Stirring];

    pub fn check(self) -> ExposureCheck {
        match self {
            CheckRunner::Fans => ExposureCheck::Fan,
            CheckRunner::Temperature => ExposureCheck::Temperature,
            CheckRunner::ProjectData => ExposureCheck::Project,
            CheckRunner::Cover => ExposureCheck::Cover,
            CheckRunner::Resin => ExposureCheck::Resin,
            CheckRunner::StartPositions => ExposureCheck::StartPositions,
            CheckRunner::Stirring => ExposureCheck::Stirring,
        }
    }

    /// Run the check and record its result.
    pub async fn run(self, ctx: &CheckContext<'_>) -> Result<(), ExposureError> {
        let check = self.check();
        tracing::info!("Running check {:?}", check);
        ctx.job.set_check_result(check, ExposureCheckResult::Running);
        let outcome = match self {
            CheckRunner::Fans => fans(ctx).await,
            CheckRunner::Temperature => temperature(ctx).await,
            CheckRunner::ProjectData => project_data(ctx).await,
            CheckRunner::Cover => cover(ctx).await,
            CheckRunner::Resin => resin(ctx).await,
            CheckRunner::StartPositions => start_positions(ctx).await,
            CheckRunner::Stirring => stirring(ctx).await,
        };
        match outcome {
            Ok(result) => {
                tracing::info!("Check {:?} finished: {:?}", check, result);
                ctx.job.set_check_result(check, result);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Check {:?} failed: {}", check, e);
                ctx.job.set_check_result(check, ExposureCheckResult::Failure);
                Err(e)
            }
        }
    }
}

/// Fans, temperature and project data run together, the rest one after
/// another. Cancellation drops every running check at its next await point.
pub async fn run_checks(ctx: &CheckContext<'_>) -> Result<(), ExposureError> {
    for check in ExposureCheck::ALL {
        ctx.job.set_check_result(check, ExposureCheckResult::Scheduled);
    }
    let pipeline = async {
        tokio::try_join!(
            CheckRunner::Fans.run(ctx),
            CheckRunner::Temperature.run(ctx),
            CheckRunner::ProjectData.run(ctx),
        )?;
        for runner in CheckRunner::SEQUENTIAL {
            runner.run(ctx).await?;
        }
        Ok(())
    };
    tokio::select! {
        result = pipeline => result,
        _ = ctx.cancel.cancelled() => {
            tracing::info!("Checks canceled");
            Err(ExposureError::Canceled)
        }
    }
}

async fn temperature(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    let uv = ctx
        .hw
        .uv_led_temperature()
        .map_err(|e| ExposureError::UvTempSensorFailed(e.to_string()))?;
    tracing::info!("UV LED temperature: {:.1} °C", uv);
    let ambient = ctx.hw.ambient_temperature()?;
    tracing::info!("Ambient temperature: {:.1} °C", ambient.value);
    if ambient.value < ambient.min {
        return ctx.warn(PrinterWarning::AmbientTooCold { temperature: ambient.value }).await;
    }
    if ambient.value > ambient.max {
        return ctx.warn(PrinterWarning::AmbientTooHot { temperature: ambient.value }).await;
    }
    Ok(ExposureCheckResult::Success)
}

async fn cleanup_previous_prints(dir: &Path) -> Result<(), ExposureError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(crate::errors::ProjectError::Io(e).into()),
    };
    while let Some(entry) = entries.next_entry().await.map_err(crate::errors::ProjectError::Io)? {
        let path = entry.path();
        if path.is_file() {
            tracing::debug!("Removing previous print {}", path.display());
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
    Ok(())
}

async fn project_data(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    let mut project = ctx
        .job
        .project()
        .ok_or_else(|| ExposureError::Worker("no project loaded".to_string()))?;
    let previous_prints = ctx.config.paths.previous_prints.as_path();
    if Path::new(project.path()).parent() != Some(previous_prints) {
        cleanup_previous_prints(previous_prints).await?;
    }
    ctx.store.copy_and_check(&mut project, previous_prints).await?;
    ctx.image.new_project(&project).await?;
    let path = project.data.path.clone();
    ctx.job.with_project_mut(|p| p.data.path = path);

    let mut result = ExposureCheckResult::Success;
    for warning in project.warnings {
        result = ctx.warn(warning).await?;
    }
    Ok(result)
}

async fn fans(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    for fan in [FanId::UvLed, FanId::Blower, FanId::Rear] {
        ctx.hw.set_fan_auto_control(fan, false);
    }
    ctx.hw.start_fans().await?;
    tokio::time::sleep(ctx.config.timing.fan_warm_up()).await;

    let failed = ctx.hw.fan_errors().await?;
    let result = if failed.is_empty() {
        ExposureCheckResult::Success
    } else if ctx.config.printer.fan_check_override {
        tracing::warn!("Ignoring failed fans {:?}, fan check override active", failed);
        ExposureCheckResult::Success
    } else {
        return Err(ExposureError::FanFailed { fans: failed });
    };
    ctx.hw.set_fan_auto_control(FanId::UvLed, true);
    Ok(result)
}

async fn cover(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    if !ctx.config.printer.cover_check {
        return Ok(ExposureCheckResult::Disabled);
    }
    let mut was_open = false;
    while !ctx.hw.is_cover_closed() {
        if !was_open {
            tracing::info!("Waiting for cover to close");
            ctx.job.set_state(ExposureState::CoverOpen)?;
            was_open = true;
        }
        tokio::time::sleep(ctx.config.timing.poll_interval()).await;
    }
    if was_open {
        ctx.job.set_state(ExposureState::Checks)?;
    }
    Ok(ExposureCheckResult::Success)
}

async fn measure_once(ctx: &CheckContext<'_>) -> Result<f64, ExposureError> {
    let limits = &ctx.config.resin;
    let volume_ml = match ctx.hw.measure_resin_volume().await {
        Ok(volume) => volume,
        Err(HardwareError::ResinMeasurement(reason)) => {
            tracing::warn!("Resin measurement failed: {}", reason);
            0.0
        }
        Err(e) => return Err(e.into()),
    };
    if volume_ml == 0.0 {
        return Err(ExposureError::ResinMeasureFailed { volume_ml });
    }
    if volume_ml < limits.min_volume_ml {
        return Err(ExposureError::ResinTooLow { volume_ml, min_ml: limits.min_volume_ml });
    }
    if volume_ml > limits.max_volume_ml {
        return Err(ExposureError::ResinTooHigh { volume_ml, max_ml: limits.max_volume_ml });
    }
    Ok(volume_ml)
}

async fn resin(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    if !ctx.config.printer.resin_sensor {
        return Ok(ExposureCheckResult::Disabled);
    }
    let mut attempt = 0;
    let measured = loop {
        match measure_once(ctx).await {
            Ok(volume) => break volume,
            Err(
                e @ (ExposureError::ResinMeasureFailed { .. }
                | ExposureError::ResinTooLow { .. }
                | ExposureError::ResinTooHigh { .. }),
            ) if attempt < ctx.config.resin.measure_retries => {
                attempt += 1;
                tracing::warn!("Resin check attempt {} failed: {}", attempt, e);
            }
            Err(e) => return Err(e),
        }
    };
    tracing::info!("Measured resin volume: {:.1} ml", measured);

    let resin_count_ml = ctx.job.snapshot().resin_count_ml;
    let (volume, level) = match ctx.resin.lock() {
        Ok(mut accountant) => {
            let volume = accountant.set_measured(measured, resin_count_ml);
            (volume, accountant.update(resin_count_ml))
        }
        Err(_) => return Err(ExposureError::Worker("resin accountant poisoned".to_string())),
    };
    ctx.job.set_resin_volume_ml(Some(volume));
    if let Some(level) = level {
        ctx.job.set_resin_remain_ml(Some(level.remain_ml));
    }

    let required_ml = ctx.job.with_project(|p| p.used_material_ml()).unwrap_or(0.0) + ctx.config.resin.min_volume_ml;
    // Projects that need more than a full tank are refilled while printing
    if measured < required_ml && required_ml <= ctx.config.resin.max_volume_ml {
        return ctx.warn(PrinterWarning::ResinNotEnough { measured_ml: measured, required_ml }).await;
    }
    Ok(ExposureCheckResult::Success)
}

async fn start_positions(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    let tower = ctx.hw.tower();
    tower.set_actual_profile("homingFast")?;
    let retries = ctx.config.timing.move_retries;
    match tower.move_and_wait(ctx.config.timing.start_position_nm, retries).await {
        Ok(()) => {}
        Err(AxisError::TowerMoveFailed) => {
            tracing::error!("Tower failed to reach start position, moving to top");
            if let Err(e) = tower.move_to(ctx.config.printer.tower_height_nm).await {
                tracing::error!("Failed to move tower to top: {}", e);
            }
            return Err(ExposureError::TowerMoveFailed);
        }
        Err(e) => return Err(e.into()),
    }
    ctx.hw.tilt().wait_to_stop().await?;
    Ok(ExposureCheckResult::Success)
}

async fn stirring(ctx: &CheckContext<'_>) -> Result<ExposureCheckResult, ExposureError> {
    let profile = ctx
        .job
        .with_project(|p| p.exposure_profile().above_area_fill.clone())
        .ok_or_else(|| ExposureError::Worker("no project loaded".to_string()))?;
    if !profile.use_tilt {
        return Ok(ExposureCheckResult::Disabled);
    }
    ctx.hw.tilt().stir_resin(&profile).await?;
    Ok(ExposureCheckResult::Success)
}
