// src/exposure/mod.rs - Exposure job: caller handle, commands and job registry
pub mod checks;
pub mod data;
pub mod estimate;
pub mod gate;
pub mod layer;
pub mod persistence;
pub mod resin;
pub mod stats;
mod worker;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::errors::{ExposureError, PersistenceError, PrinterWarning, ProjectError};
use crate::hardware::{ExposureImage, Hardware, ProfileSet};
use crate::project::{ExposureProfile, ProjectStore};
use crate::state::ExposureState;

use data::{JobData, JobEvent, JobState};
use estimate::TimingModel;
use gate::WarningGate;
use persistence::ExposurePickler;
use worker::Worker;

/// Commands consumed by the worker, in the order they were issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ConfirmResinIn,
    Continue,
    Back,
    Pause,
    FeedMe,
    UpAndDown,
    Exit,
    InjectTowerFail,
}

/// Sending half of the job's cancellation token.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelToken(rx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the job is canceled, never if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The collaborators a job runs against.
#[derive(Clone)]
pub struct PrinterContext {
    pub config: Arc<Config>,
    pub hw: Arc<dyn Hardware>,
    pub image: Arc<dyn ExposureImage>,
    pub store: Arc<dyn ProjectStore>,
}

const ACTIVE_STATES: &[ExposureState] = &[
    ExposureState::Confirm,
    ExposureState::PourInResin,
    ExposureState::HomingAxis,
    ExposureState::Checks,
    ExposureState::Printing,
    ExposureState::GoingUp,
    ExposureState::GoingDown,
    ExposureState::Waiting,
    ExposureState::CoverOpen,
    ExposureState::Stirring,
    ExposureState::FeedMe,
    ExposureState::PendingAction,
    ExposureState::Stuck,
    ExposureState::StuckRecovery,
    ExposureState::CoolingDown,
    ExposureState::CheckWarning,
];

/// One print job. Callers issue commands and read snapshots, the job's
/// worker task does everything else.
pub struct Exposure {
    ctx: PrinterContext,
    job: Arc<JobState>,
    gate: Arc<WarningGate>,
    timing: TimingModel,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancelHandle,
    cancel_requested: AtomicBool,
    worker: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Exposure {
    pub fn new(ctx: PrinterContext) -> Self {
        Self::with_job(ctx, Arc::new(JobState::new()))
    }

    fn with_job(ctx: PrinterContext, job: Arc<JobState>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (cancel, token) = CancelHandle::new();
        let gate = Arc::new(WarningGate::new(ctx.hw.power_led()));
        let timing = TimingModel::from_config(&ctx.config);
        let worker = Worker::new(ctx.clone(), job.clone(), gate.clone(), token, rx);
        Self {
            ctx,
            job,
            gate,
            timing,
            commands,
            cancel,
            cancel_requested: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        }
    }

    /// Rebuild the last saved job. Jobs saved mid-run cannot continue and
    /// come back as failed.
    pub async fn restore(ctx: PrinterContext, pickler: &ExposurePickler) -> Result<Option<Self>, ExposureError> {
        let Some((mut data, project)) = pickler.load(ctx.store.as_ref()).await? else {
            return Ok(None);
        };
        if !data.state.is_finished() && data.state != ExposureState::Confirm {
            tracing::warn!("Saved job was interrupted in state {}", data.state);
            data.state = ExposureState::Failure;
            data.fatal_error = Some(Arc::new(ExposureError::Worker(
                "job interrupted by restart".to_string(),
            )));
        }
        tracing::info!("Restored job in state {}", data.state);
        let job = Arc::new(JobState::from_data(data, Some(project)));
        Ok(Some(Self::with_job(ctx, job)))
    }

    pub fn save(&self, pickler: &ExposurePickler) -> Result<(), PersistenceError> {
        let project = self
            .job
            .with_project(|p| p.data.clone())
            .ok_or_else(|| PersistenceError::Malformed("project".to_string()))?;
        pickler.save(&self.job.snapshot(), &project)
    }

    fn require(&self, allowed: &[ExposureState]) -> Result<ExposureState, ExposureError> {
        let state = self.job.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(ExposureError::NotAvailableInState {
                state,
                allowed: allowed.to_vec(),
            })
        }
    }

    fn send(&self, command: Command) -> Result<(), ExposureError> {
        tracing::debug!("Queueing command {:?}", command);
        self.commands
            .send(command)
            .map_err(|_| ExposureError::Worker("command queue closed".to_string()))
    }

    /// Validate the printer and load the project. The returned error is
    /// the one recorded as the job's `fatal_error`.
    pub async fn read_project(&self, path: &str) -> Result<(), Arc<ExposureError>> {
        self.require(&[ExposureState::Init])?;
        self.job.set_state(ExposureState::ReadingProject)?;
        match self.load_project(path).await {
            Ok(()) => Ok(self.job.set_state(ExposureState::Confirm)?),
            Err(e) => {
                tracing::error!("Failed to read project '{}': {}", path, e);
                let error = Arc::new(e);
                self.job.set_print_end_time(Utc::now());
                self.job.set_fatal_error(error.clone());
                self.job.set_state(ExposureState::Failure)?;
                worker::power_off(self.ctx.hw.as_ref(), self.ctx.image.as_ref()).await;
                Err(error)
            }
        }
    }

    async fn load_project(&self, path: &str) -> Result<(), ExposureError> {
        let printer = &self.ctx.config.printer;
        if !printer.calibrated {
            return Err(ExposureError::NotMechanicallyCalibrated);
        }
        if printer.uv_pwm_print == 0 {
            return Err(ExposureError::NotUvCalibrated);
        }
        let project = self.ctx.store.open(path).await?;
        let tilt = ProfileSet::from_config(&self.ctx.config.motion.tilt);
        let tower = ProfileSet::from_config(&self.ctx.config.motion.tower);
        let profiles = project.exposure_profile();
        profiles.below_area_fill.validate(&tilt, &tower)?;
        profiles.above_area_fill.validate(&tilt, &tower)?;
        let estimate = self.timing.estimate_total_ms(&project)?;
        tracing::info!(
            "Project '{}' loaded: {} layers, estimated {} s",
            project.name,
            project.total_layers(),
            estimate / 1000
        );
        self.job.set_project(project);
        self.job.set_estimated_total_time_ms(estimate);
        Ok(())
    }

    pub fn confirm_start(&self) -> Result<(), ExposureError> {
        let state = self.require(&[ExposureState::Confirm])?;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take()).ok_or(
            ExposureError::NotAvailableInState {
                state,
                allowed: Vec::new(),
            },
        )?;
        tracing::info!("Starting exposure worker");
        let handle = tokio::spawn(worker.run());
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    pub fn confirm_resin_in(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::PourInResin])?;
        self.send(Command::ConfirmResinIn)
    }

    pub fn confirm_warning(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::CheckWarning])?;
        if self.gate.confirm() { Ok(()) } else { Err(ExposureError::NoPendingWarning) }
    }

    pub fn reject_warning(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::CheckWarning])?;
        if self.gate.reject() { Ok(()) } else { Err(ExposureError::NoPendingWarning) }
    }

    fn worker_started(&self) -> bool {
        self.worker.lock().map(|w| w.is_none()).unwrap_or(true)
    }

    /// Idempotent. While printing the current layer is finished first.
    pub fn cancel(&self) -> Result<(), ExposureError> {
        let state = self.job.state();
        if state.is_finished() {
            return Ok(());
        }
        self.require(ACTIVE_STATES)?;
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if state == ExposureState::Confirm && !self.worker_started() {
            // Nothing runs yet, drop the worker with the job
            if let Ok(mut worker) = self.worker.lock() {
                worker.take();
            }
            tracing::info!("Job canceled before start");
            return self.job.set_state(ExposureState::Done);
        }
        tracing::info!("Canceling job in state {}", state);
        self.cancel.cancel();
        self.send(Command::Exit)
    }

    pub fn pause(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::Printing])?;
        self.send(Command::Pause)
    }

    pub fn feedme(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::Printing])?;
        self.send(Command::FeedMe)
    }

    pub fn up_and_down(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::Printing])?;
        self.send(Command::UpAndDown)
    }

    pub fn inject_fatal_error(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::Printing])?;
        self.send(Command::InjectTowerFail)
    }

    /// Resume from feed-me, stuck recovery or pause.
    pub fn continue_printing(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::FeedMe, ExposureState::Stuck, ExposureState::Printing])?;
        self.send(Command::Continue)
    }

    pub fn back(&self) -> Result<(), ExposureError> {
        self.require(&[ExposureState::FeedMe, ExposureState::Stuck, ExposureState::Printing])?;
        self.send(Command::Back)
    }

    /// Statistics seen: a finished job moves on to `DONE`.
    pub fn acknowledge(&self) -> Result<(), ExposureError> {
        self.job.acknowledge()
    }

    /// Change exposure times of the loaded project. Applied to every layer
    /// not exposed yet.
    pub fn set_exposure_times(
        &self,
        exposure_time_ms: u32,
        exposure_time_first_ms: u32,
        calibrate_time_ms: Option<u32>,
    ) -> Result<(), ExposureError> {
        self.require(ACTIVE_STATES)?;
        let estimate = self
            .job
            .with_project_mut(|project| -> Result<i64, ExposureError> {
                let mut updated = project.clone();
                updated.set_exposure_time_ms(exposure_time_ms)?;
                updated.set_exposure_time_first_ms(exposure_time_first_ms)?;
                if let Some(calibrate) = calibrate_time_ms {
                    updated.set_calibrate_time_ms(calibrate)?;
                }
                let estimate = self.timing.estimate_total_ms(&updated)?;
                *project = updated;
                Ok(estimate)
            })
            .ok_or(ExposureError::Project(ProjectError::NoLayers))??;
        self.job.set_estimated_total_time_ms(estimate);
        Ok(())
    }

    pub fn set_exposure_profile(&self, profile: ExposureProfile) -> Result<(), ExposureError> {
        self.require(&[ExposureState::Confirm])?;
        let tilt = ProfileSet::from_config(&self.ctx.config.motion.tilt);
        let tower = ProfileSet::from_config(&self.ctx.config.motion.tower);
        profile.below_area_fill.validate(&tilt, &tower)?;
        profile.above_area_fill.validate(&tilt, &tower)?;
        let estimate = self
            .job
            .with_project_mut(|project| {
                project.set_exposure_profile(profile);
                self.timing.estimate_total_ms(project)
            })
            .ok_or(ExposureError::Project(ProjectError::NoLayers))??;
        self.job.set_estimated_total_time_ms(estimate);
        Ok(())
    }

    pub fn state(&self) -> ExposureState {
        self.job.state()
    }

    pub fn snapshot(&self) -> JobData {
        self.job.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.job.subscribe()
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<PrinterWarning> {
        self.job.subscribe_warnings()
    }

    pub fn field_changes(&self, field: &'static str) -> impl Stream<Item = Value> + use<> {
        self.job.field_changes(field)
    }

    pub fn total_layers(&self) -> usize {
        self.job.with_project(|p| p.total_layers()).unwrap_or(0)
    }

    /// Completed fraction of the print, 1.0 once finished. `actual_layer`
    /// already counts completed layers.
    pub fn progress(&self) -> f64 {
        let data = self.job.snapshot();
        let total = self.total_layers();
        if data.state == ExposureState::Finished {
            1.0
        } else if total == 0 {
            0.0
        } else {
            data.actual_layer as f64 / total as f64
        }
    }

    pub fn estimate_remaining_ms(&self) -> i64 {
        let data = self.job.snapshot();
        if data.state.is_finished() {
            return 0;
        }
        self.job
            .with_project(|p| self.timing.count_remain_time(p, data.actual_layer, data.slow_layers_done))
            .and_then(Result::ok)
            .unwrap_or(0)
    }

    pub fn expected_finish_timestamp(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.estimate_remaining_ms())
    }

    /// Wait for the worker to exit.
    pub async fn join(&self) -> Result<(), ExposureError> {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        match handle {
            Some(handle) => handle.await.map_err(|e| ExposureError::Worker(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Non-owning handle to a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Owns every job; the IPC layer refers to them by [`JobId`].
#[derive(Default)]
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, Arc<Exposure>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, exposure: Exposure) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(id, Arc::new(exposure));
        }
        tracing::debug!("Registered {}", id);
        id
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Exposure>> {
        self.jobs.read().ok().and_then(|jobs| jobs.get(&id).cloned())
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<Exposure>> {
        self.jobs.write().ok().and_then(|mut jobs| jobs.remove(&id))
    }

    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .jobs
            .read()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Drop jobs whose result was acknowledged.
    pub fn prune_done(&self) -> usize {
        let Ok(mut jobs) = self.jobs.write() else {
            return 0;
        };
        let before = jobs.len();
        jobs.retain(|_, job| job.state() != ExposureState::Done);
        before - jobs.len()
    }
}
