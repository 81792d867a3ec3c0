// src/exposure/worker.rs - Job worker: command loop, checks and the layer loop
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::checks::{CheckContext, run_checks};
use super::data::JobState;
use super::estimate::TimingModel;
use super::gate::WarningGate;
use super::layer::{FillTracker, ProfileChoice, area_fill_percent};
use super::persistence::ExposurePickler;
use super::resin::{ResinAccountant, layer_volume_ml};
use super::stats::PrintStatistics;
use super::{CancelToken, Command, PrinterContext};
use crate::errors::{AxisError, ExposureError, FanId, PrinterWarning};
use crate::hardware::{ExposureImage, Hardware};
use crate::project::{ExposureProfile, LayerProfile, Project};
use crate::state::{ExposureCheck, ExposureCheckResult, ExposureState};

/// Turn off everything a job may have switched on. Failures are logged only.
pub(crate) async fn power_off(hw: &dyn Hardware, image: &dyn ExposureImage) {
    if let Err(e) = hw.uv_led_off().await {
        tracing::error!("Failed to turn UV LED off: {}", e);
    }
    image.stop_counting_usage().await;
    if let Err(e) = hw.save_uv_usage().await {
        tracing::error!("Failed to save UV usage: {}", e);
    }
    if let Err(e) = image.save_display_usage().await {
        tracing::error!("Failed to save display usage: {}", e);
    }
    if let Err(e) = hw.stop_fans().await {
        tracing::error!("Failed to stop fans: {}", e);
    }
    if let Err(e) = hw.motors_release().await {
        tracing::error!("Failed to release motors: {}", e);
    }
}

/// Outcome of rendering one frame.
enum Frame {
    Done { white_pixels: u64 },
    TiltStuck,
}

pub(crate) struct Worker {
    ctx: PrinterContext,
    job: Arc<JobState>,
    gate: Arc<WarningGate>,
    cancel: CancelToken,
    commands: mpsc::UnboundedReceiver<Command>,
    resin: Mutex<ResinAccountant>,
    pickler: ExposurePickler,
    timing: TimingModel,
    choice: ProfileChoice,
    was_stirring: bool,
    expo_comp_ms: u32,
    failed_fans: Vec<FanId>,
}

impl Worker {
    pub(crate) fn new(
        ctx: PrinterContext,
        job: Arc<JobState>,
        gate: Arc<WarningGate>,
        cancel: CancelToken,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let resin = Mutex::new(ResinAccountant::new(&ctx.config.resin));
        let pickler = ExposurePickler::new(ctx.config.paths.last_project.clone());
        let timing = TimingModel::from_config(&ctx.config);
        Self {
            ctx,
            job,
            gate,
            cancel,
            commands,
            resin,
            pickler,
            timing,
            choice: ProfileChoice::AboveAreaFill,
            was_stirring: false,
            expo_comp_ms: 0,
            failed_fans: Vec::new(),
        }
    }

    fn retries(&self) -> u32 {
        self.ctx.config.timing.move_retries
    }

    pub(crate) async fn run(mut self) {
        let result = self.run_inner().await;
        self.ctx.hw.set_cover_override(false);
        let terminal = match result {
            Ok(state) => state,
            Err(e) => self.fail(e).await,
        };
        power_off(self.ctx.hw.as_ref(), self.ctx.image.as_ref()).await;
        if let Err(e) = self.job.set_state(terminal) {
            tracing::error!("Failed to enter terminal state: {}", e);
        }
        self.save();
        tracing::info!("Exposure worker finished in state {}", terminal);
    }

    fn save(&self) {
        let Some(project) = self.job.with_project(|p| p.data.clone()) else {
            return;
        };
        if let Err(e) = self.pickler.save(&self.job.snapshot(), &project) {
            tracing::error!("Failed to save exposure data: {}", e);
        }
    }

    /// Record the failure. The platform is raised unless the failure is a
    /// motion fault; the job's state is left for the caller to finalize.
    async fn fail(&mut self, error: ExposureError) -> ExposureState {
        let terminal = if error.is_cancellation() {
            ExposureState::Canceled
        } else {
            ExposureState::Failure
        };
        if matches!(error, ExposureError::Canceled) {
            tracing::info!("Exposure canceled");
            self.job.set_canceled();
        } else {
            tracing::error!("Exposure failed: {}", error);
        }
        if !error.is_motion_fault() {
            if let Err(e) = self.raise_platform().await {
                tracing::error!("Failed to raise platform after failure: {}", e);
            }
        }
        self.job.set_print_end_time(Utc::now());
        if !matches!(error, ExposureError::Canceled) {
            self.job.set_fatal_error(Arc::new(error));
        }
        terminal
    }

    async fn raise_platform(&self) -> Result<(), ExposureError> {
        let tower = self.ctx.hw.tower();
        tower.set_actual_profile("homingFast")?;
        tower
            .move_and_wait(self.ctx.config.printer.tower_height_nm, self.retries())
            .await?;
        Ok(())
    }

    async fn run_inner(&mut self) -> Result<ExposureState, ExposureError> {
        let tower = self.ctx.hw.tower();
        let tilt = self.ctx.hw.tilt();
        self.ctx.hw.set_cover_override(true);
        if !tower.synced() || !tilt.synced() {
            self.job.set_state(ExposureState::HomingAxis)?;
            let retries = self.retries();
            tokio::try_join!(tower.sync_and_wait(retries), tilt.sync_and_wait(retries))?;
        }

        self.job.set_state(ExposureState::PourInResin)?;
        loop {
            match self.commands.recv().await {
                Some(Command::ConfirmResinIn) => break,
                Some(Command::Exit) | None => {
                    self.job.set_canceled();
                    self.job.set_print_end_time(Utc::now());
                    return Ok(ExposureState::Canceled);
                }
                Some(other) => tracing::debug!("Ignoring {:?} while waiting for resin", other),
            }
        }

        self.ctx.hw.set_cover_override(false);
        self.job.set_state(ExposureState::Checks)?;
        {
            let ctx = CheckContext {
                job: &self.job,
                hw: self.ctx.hw.as_ref(),
                image: self.ctx.image.as_ref(),
                store: self.ctx.store.as_ref(),
                config: &self.ctx.config,
                gate: &self.gate,
                resin: &self.resin,
                cancel: self.cancel.clone(),
            };
            run_checks(&ctx).await?;
        }
        self.job.set_state(ExposureState::Printing)?;
        self.print().await
    }

    fn project(&self) -> Result<Project, ExposureError> {
        self.job
            .project()
            .ok_or_else(|| ExposureError::Worker("no project loaded".to_string()))
    }

    async fn prepare(&mut self, project: &Project) -> Result<(), ExposureError> {
        let hw = &self.ctx.hw;
        self.ctx.image.preload_image(0).await;
        let tower = hw.tower();
        tower.set_actual_profile(&project.exposure_profile().above_area_fill.tower_profile)?;
        let first_height = project.layers.first().map(|l| l.height_nm).unwrap_or(0);
        let position = first_height + self.ctx.config.printer.calib_tower_offset_nm;
        self.job.set_tower_position_nm(position);
        tower.move_and_wait(position, self.retries()).await?;
        self.ctx.image.blank_screen().await?;
        hw.set_uv_pwm(self.ctx.config.printer.uv_pwm_print).await?;
        self.ctx.image.start_counting_usage().await;
        Ok(())
    }

    async fn print(&mut self) -> Result<ExposureState, ExposureError> {
        let project = self.project()?;
        self.prepare(&project).await?;
        let start = Utc::now();
        self.job.set_print_start_time(start);
        let stats_path = self.ctx.config.paths.statistics.clone();
        if let Err(e) = PrintStatistics::record_start(&stats_path) {
            tracing::error!("Failed to update statistics: {}", e);
        }

        let total = project.total_layers();
        let mut fills = FillTracker::new(
            project.exposure_profile().area_fill,
            self.ctx.config.printer.force_slow_tilt_height_nm,
            project.first_slow_layers(),
        );
        self.choice = ProfileChoice::AboveAreaFill;
        // The resin was just stirred by the checks
        self.was_stirring = self.job.snapshot().check_results.get(&ExposureCheck::Stirring)
            == Some(&ExposureCheckResult::Success);
        let mut exited = false;

        while self.job.snapshot().actual_layer < total {
            let mut feedme = false;
            match self.commands.try_recv() {
                Ok(Command::UpAndDown) => {
                    self.job.set_state(ExposureState::PendingAction)?;
                    self.up_and_down().await?;
                }
                Ok(Command::Exit) => {
                    self.job.set_state(ExposureState::PendingAction)?;
                    exited = true;
                    break;
                }
                Ok(Command::InjectTowerFail) => {
                    tracing::error!("Injected tower failure");
                    return Err(ExposureError::TowerFailed);
                }
                Ok(Command::Pause) => {
                    tracing::info!("Print paused");
                    if self.do_wait(false).await == Command::Exit {
                        exited = true;
                        break;
                    }
                    tracing::info!("Print resumed");
                }
                Ok(Command::FeedMe) => {
                    self.job.set_state(ExposureState::PendingAction)?;
                    feedme = true;
                }
                Ok(other) => tracing::debug!("Ignoring {:?} while printing", other),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    exited = true;
                    break;
                }
            }

            let actual_layer = self.job.snapshot().actual_layer;
            let every = self.ctx.config.printer.up_and_down_every_layer as usize;
            if every > 0 && actual_layer > 0 && actual_layer % every == 0 {
                self.up_and_down().await?;
            }

            if self.ctx.hw.uv_led_overheat() && !self.cool_down().await? {
                exited = true;
                break;
            }
            self.check_fans().await;

            self.update_resin();
            let resin_low = self.job.snapshot().resin_low;
            if (feedme || resin_low) && !self.feed_me(resin_low).await? {
                exited = true;
                break;
            }
            if self.job.state() == ExposureState::PendingAction {
                self.job.set_state(ExposureState::Printing)?;
            }

            if !self.expose_layer(&mut fills, total, start).await? {
                exited = true;
                break;
            }
        }

        let profile = self.current_profile()?;
        if exited {
            self.job.set_canceled();
            if let Err(e) = self.ctx.hw.tilt().layer_down_wait(&profile).await {
                tracing::error!("Failed to lower tilt after cancel: {}", e);
            }
        }
        self.job.set_state(ExposureState::GoingUp)?;
        self.raise_platform().await?;
        self.job.set_state(ExposureState::Printing)?;

        let end = Utc::now();
        self.job.set_print_end_time(end);
        let data = self.job.snapshot();
        let seconds = (end - start).num_seconds().max(0) as u64;
        if let Err(e) =
            PrintStatistics::record_finish(&stats_path, !exited, data.actual_layer as u64, seconds, data.resin_count_ml)
        {
            tracing::error!("Failed to update statistics: {}", e);
        }
        tracing::info!(
            "Job finished: {} of {} layers, {} s, {:.1} ml resin",
            data.actual_layer,
            total,
            seconds,
            data.resin_count_ml
        );
        Ok(if exited { ExposureState::Canceled } else { ExposureState::Finished })
    }

    fn current_profile(&self) -> Result<LayerProfile, ExposureError> {
        self.job
            .with_project(|p| self.choice.profile(p.exposure_profile()).clone())
            .ok_or_else(|| ExposureError::Worker("no project loaded".to_string()))
    }

    /// Expose the current layer and peel it. Returns false when the job was
    /// exited during stuck recovery.
    async fn expose_layer(
        &mut self,
        fills: &mut FillTracker,
        total: usize,
        start: chrono::DateTime<Utc>,
    ) -> Result<bool, ExposureError> {
        let data = self.job.snapshot();
        let actual_layer = data.actual_layer;
        let (layer, next_height, profiles, remain_ms) = self
            .job
            .with_project(|p| {
                (
                    p.layers[actual_layer].clone(),
                    p.layers.get(actual_layer + 1).map(|l| l.height_nm),
                    p.exposure_profile().clone(),
                    self.timing
                        .count_remain_time(p, actual_layer, data.slow_layers_done)
                        .unwrap_or(0),
                )
            })
            .ok_or_else(|| ExposureError::Worker("no project loaded".to_string()))?;

        let mut times = layer.times_ms.clone();
        if let Some(first) = times.first_mut() {
            *first += self.expo_comp_ms;
        }
        self.expo_comp_ms = 0;

        let last_layer = actual_layer + 1 == total;
        let previous_position = data.tower_position_nm;
        let position = match next_height {
            Some(height) if !last_layer => previous_position + height,
            _ => previous_position,
        };
        self.job.set_tower_position_nm(position);

        tracing::info!(
            "Layer {}/{} started: times {:?} ms, slow layers done {}, height {} nm, elapsed {} min, remaining {} min, resin used {:.1} ml, remaining {:?} ml",
            actual_layer + 1,
            total,
            times,
            data.slow_layers_done,
            layer.height_nm,
            (Utc::now() - start).num_minutes(),
            remain_ms / 60_000,
            data.resin_count_ml,
            data.resin_remain_ml
        );

        let frame = self
            .do_frame(&profiles, &times, fills, layer.height_nm, position, last_layer)
            .await?;
        match frame {
            Frame::Done { white_pixels } => {
                let used = layer_volume_ml(white_pixels, self.ctx.config.printer.pixel_size_nm, layer.height_nm);
                self.job.set_resin_count_ml(data.resin_count_ml + used);
                self.job.set_actual_layer(actual_layer + 1);
                Ok(true)
            }
            Frame::TiltStuck => {
                // The layer is repeated from the position it started at
                self.job.set_tower_position_nm(previous_position);
                self.stuck_recovery().await
            }
        }
    }

    async fn do_frame(
        &mut self,
        profiles: &ExposureProfile,
        times: &[u32],
        fills: &mut FillTracker,
        layer_height_nm: i64,
        position: i64,
        last_layer: bool,
    ) -> Result<Frame, ExposureError> {
        let printer = &self.ctx.config.printer;
        let image = &self.ctx.image;
        let white_pixels = image.sync_preloader().await?;
        let profile = self.choice.profile(profiles).clone();

        tokio::time::sleep(Duration::from_millis(profile.delay_before_exposure_ms)).await;
        if self.was_stirring {
            tokio::time::sleep(Duration::from_millis(printer.stirring_delay_ms)).await;
            self.was_stirring = false;
        }

        image.blit_image().await?;
        let total_ms: u64 = times.iter().map(|t| u64::from(*t)).sum();
        self.job
            .set_exposure_end(Some(Utc::now() + chrono::Duration::milliseconds(total_ms as i64)));
        match times {
            [single] => {
                self.ctx.hw.uv_led_pulse(u64::from(*single)).await?;
                let poll = self.ctx.config.timing.poll_interval_ms;
                loop {
                    let remaining = self.ctx.hw.uv_led_pulse_remaining_ms();
                    if remaining == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(remaining.min(poll))).await;
                }
                image.blank_screen().await?;
            }
            _ => {
                // Calibration: regions are blanked one by one
                self.ctx.hw.uv_led_on().await?;
                for (i, time) in times.iter().enumerate() {
                    tokio::time::sleep(Duration::from_millis(u64::from(*time))).await;
                    image.blank_area(i, i + 1 == times.len()).await?;
                }
                self.ctx.hw.uv_led_off().await?;
            }
        }
        self.job.set_exposure_end(None);

        let actual_layer = self.job.snapshot().actual_layer;
        image.preload_image(actual_layer + 1).await;
        tokio::time::sleep(Duration::from_millis(profile.delay_after_exposure_ms)).await;

        let fill = area_fill_percent(white_pixels, printer.pixels_per_percent);
        self.job.set_current_area_fill(fill as u32);
        self.choice = fills.select(fill, actual_layer, layer_height_nm);
        if self.choice.is_slow() {
            let done = self.job.snapshot().slow_layers_done + 1;
            self.job.set_slow_layers_done(done);
        }
        let profile = self.choice.profile(profiles);
        tracing::debug!("Area fill {:.1}%, peel with {:?}", fill, self.choice);

        self.ctx.hw.tower().set_actual_profile(&profile.tower_profile)?;
        match self.ctx.hw.tilt().layer_peel_moves(profile, position, last_layer).await {
            Ok(()) => Ok(Frame::Done { white_pixels }),
            Err(AxisError::TiltHomeFailed) => {
                tracing::error!("Tilt homing failed during peel of layer {}", actual_layer);
                Ok(Frame::TiltStuck)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until continue, back or exit arrives.
    async fn do_wait(&mut self, beep: bool) -> Command {
        let tick = self.ctx.config.timing.wait_tick();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(c @ (Command::Continue | Command::Back | Command::Exit)) => return c,
                    Some(other) => tracing::debug!("Ignoring {:?} while waiting", other),
                    None => return Command::Exit,
                },
                _ = tokio::time::sleep(tick) => {
                    if beep {
                        self.ctx.hw.beep_alarm(3).await;
                    }
                }
            }
        }
    }

    /// Sleep unless the job gets canceled first; false when canceled.
    async fn sleep_unless_canceled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Wait for the cover, reporting `COVER_OPEN` meanwhile. False when canceled.
    async fn wait_cover_closed(&self, resume: ExposureState) -> Result<bool, ExposureError> {
        if !self.ctx.config.printer.cover_check || self.ctx.hw.is_cover_closed() {
            return Ok(true);
        }
        self.job.set_state(ExposureState::CoverOpen)?;
        while !self.ctx.hw.is_cover_closed() {
            if !self.sleep_unless_canceled(self.ctx.config.timing.poll_interval()).await {
                return Ok(false);
            }
        }
        self.job.set_state(resume)?;
        Ok(true)
    }

    /// Returns false when exited while cooling down.
    async fn cool_down(&mut self) -> Result<bool, ExposureError> {
        let _indicator = self.ctx.hw.power_led().error_scope();
        tracing::warn!("UV LED overheated, waiting for it to cool down");
        self.job.set_state(ExposureState::CoolingDown)?;
        let poll = self.ctx.config.timing.cool_down_poll();
        while self.ctx.hw.uv_led_overheat() {
            self.ctx.hw.beep_alarm(3).await;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Exit) | None => return Ok(false),
                    Some(other) => tracing::debug!("Ignoring {:?} while cooling down", other),
                },
                _ = tokio::time::sleep(poll) => {}
            }
        }
        self.job.set_state(ExposureState::Printing)?;
        Ok(true)
    }

    /// Publish newly failing fans as an informational warning.
    async fn check_fans(&mut self) {
        match self.ctx.hw.fan_errors().await {
            Ok(failed) => {
                let new: Vec<String> = failed
                    .iter()
                    .filter(|fan| !self.failed_fans.contains(fan))
                    .map(|fan| fan.to_string())
                    .collect();
                if !new.is_empty() {
                    self.job
                        .warning_occurred(PrinterWarning::ExpectOverheating { fans: new.join(", ") });
                }
                self.failed_fans = failed;
            }
            Err(e) => tracing::debug!("Failed to read fan errors: {}", e),
        }
    }

    fn update_resin(&self) {
        let count = self.job.snapshot().resin_count_ml;
        let level = self.resin.lock().ok().and_then(|r| r.update(count));
        if let Some(level) = level {
            self.job.set_resin_remain_ml(Some(level.remain_ml));
            self.job.set_resin_warn(level.warn);
            self.job.set_resin_low(level.low);
        }
    }

    /// Wait for the user to refill resin. Returns false when exited.
    async fn feed_me(&mut self, resin_low: bool) -> Result<bool, ExposureError> {
        let _indicator = self.ctx.hw.power_led().error_scope();
        tracing::info!("Feed me requested, resin low: {}", resin_low);
        self.job.set_state(ExposureState::FeedMe)?;
        match self.do_wait(resin_low).await {
            Command::Exit => return Ok(false),
            Command::Continue => {
                let count = self.job.snapshot().resin_count_ml;
                let volume = self.resin.lock().ok().map(|mut r| r.refill(count));
                if let Some(volume) = volume {
                    tracing::info!("Resin refilled, tank volume {:.1} ml", volume - count);
                    self.job.set_resin_volume_ml(Some(volume));
                }
                self.update_resin();
            }
            _ => tracing::info!("Feed me left without refill"),
        }
        if !self.wait_cover_closed(ExposureState::FeedMe).await? {
            return Ok(false);
        }
        let profile = self.current_profile()?;
        if profile.use_tilt {
            self.job.set_state(ExposureState::Stirring)?;
            self.ctx.hw.tilt().stir_resin(&profile).await?;
        }
        self.was_stirring = true;
        self.job.set_state(ExposureState::Printing)?;
        Ok(true)
    }

    async fn up_and_down(&mut self) -> Result<(), ExposureError> {
        let _indicator = self.ctx.hw.power_led().warning_scope();
        let printer = &self.ctx.config.printer;
        if printer.up_and_down_uv_on {
            self.ctx.hw.uv_led_on().await?;
        }

        self.job.set_state(ExposureState::GoingUp)?;
        let tower = self.ctx.hw.tower();
        tower.set_actual_profile("homingFast")?;
        tower.move_and_wait(printer.tower_height_nm, self.retries()).await?;

        self.job.set_state(ExposureState::Waiting)?;
        for remaining in (1..=printer.up_and_down_wait_sec).rev() {
            self.job.set_remaining_wait_sec(remaining);
            if !self.sleep_unless_canceled(self.ctx.config.timing.wait_tick()).await {
                break;
            }
            if !self.wait_cover_closed(ExposureState::Waiting).await? {
                break;
            }
        }
        self.job.set_remaining_wait_sec(0);

        let profile = self.current_profile()?;
        if profile.use_tilt {
            self.job.set_state(ExposureState::Stirring)?;
            self.ctx.hw.tilt().stir_resin(&profile).await?;
        }

        self.job.set_state(ExposureState::GoingDown)?;
        let position = self.job.snapshot().tower_position_nm + printer.up_and_down_z_offset_nm.max(0);
        tower.move_and_wait(position, self.retries()).await?;
        tower.set_actual_profile(&profile.tower_profile)?;
        if printer.up_and_down_uv_on {
            self.ctx.hw.uv_led_off().await?;
        }

        self.was_stirring = true;
        self.expo_comp_ms = printer.up_and_down_expo_comp * 100;
        self.job.set_state(ExposureState::Printing)?;
        Ok(())
    }

    /// Tilt got stuck during a peel. Continue re-homes and retries the
    /// layer, back fails the job. Returns false when exited.
    async fn stuck_recovery(&mut self) -> Result<bool, ExposureError> {
        let _indicator = self.ctx.hw.power_led().error_scope();
        let tilt = self.ctx.hw.tilt();
        self.job.set_state(ExposureState::Stuck)?;
        if let Err(e) = tilt.release().await {
            tracing::error!("Failed to release tilt: {}", e);
        }
        match self.do_wait(true).await {
            Command::Back => return Err(ExposureError::TiltFailed),
            Command::Exit => return Ok(false),
            _ => {}
        }

        self.job.set_state(ExposureState::StuckRecovery)?;
        tilt.sync_and_wait(self.retries()).await?;
        let profile = self.current_profile()?;
        if profile.use_tilt {
            self.job.set_state(ExposureState::Stirring)?;
            tilt.stir_resin(&profile).await?;
        }
        self.was_stirring = true;
        self.job.set_state(ExposureState::Printing)?;
        tracing::info!("Stuck recovery done, repeating layer {}", self.job.snapshot().actual_layer);
        Ok(true)
    }
}
