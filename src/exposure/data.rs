// src/exposure/data.rs - Shared job record with per-field change notifications
use async_stream::stream;
use chrono::{DateTime, SubsecRound, Utc};
use futures_core::Stream;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::errors::{ExposureError, PrinterWarning};
use crate::project::Project;
use crate::state::{ExposureCheck, ExposureCheckResult, ExposureState};

const EVENT_CAPACITY: usize = 256;

pub type CheckResults = BTreeMap<ExposureCheck, ExposureCheckResult>;

/// A single field change, published after the field was written.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub field: &'static str,
    pub value: Value,
}

/// Observable state of one exposure job. Timestamps are kept at
/// microsecond precision.
#[derive(Debug, Clone)]
pub struct JobData {
    pub state: ExposureState,
    pub actual_layer: usize,
    pub slow_layers_done: usize,
    pub tower_position_nm: i64,
    pub resin_count_ml: f64,
    pub resin_volume_ml: Option<f64>,
    pub resin_remain_ml: Option<f64>,
    pub resin_warn: bool,
    pub resin_low: bool,
    pub remaining_wait_sec: u32,
    pub estimated_total_time_ms: i64,
    pub print_start_time: Option<DateTime<Utc>>,
    pub print_end_time: Option<DateTime<Utc>>,
    pub exposure_end: Option<DateTime<Utc>>,
    pub check_results: CheckResults,
    pub warning: Option<PrinterWarning>,
    pub fatal_error: Option<Arc<ExposureError>>,
    pub current_area_fill: u32,
    pub canceled: bool,
}

impl Default for JobData {
    fn default() -> Self {
        Self {
            state: ExposureState::Init,
            actual_layer: 0,
            slow_layers_done: 0,
            tower_position_nm: 0,
            resin_count_ml: 0.0,
            resin_volume_ml: None,
            resin_remain_ml: None,
            resin_warn: false,
            resin_low: false,
            remaining_wait_sec: 0,
            estimated_total_time_ms: -1,
            print_start_time: None,
            print_end_time: None,
            exposure_end: None,
            check_results: CheckResults::new(),
            warning: None,
            fatal_error: None,
            current_area_fill: 0,
            canceled: false,
        }
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |t| json!(t.timestamp_micros() as f64 / 1e6))
}

/// Job record shared between the worker (sole writer) and observers.
///
/// Every setter publishes a [`JobEvent`]. Once the job reached a terminal
/// state the setters are no-ops, only [`JobState::acknowledge`] may move it
/// on to `DONE`.
#[derive(Debug)]
pub struct JobState {
    data: RwLock<JobData>,
    project: RwLock<Option<Project>>,
    events: broadcast::Sender<JobEvent>,
    warnings: broadcast::Sender<PrinterWarning>,
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

impl JobState {
    pub fn new() -> Self {
        Self::from_data(JobData::default(), None)
    }

    pub fn from_data(data: JobData, project: Option<Project>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (warnings, _) = broadcast::channel(16);
        Self {
            data: RwLock::new(data),
            project: RwLock::new(project),
            events,
            warnings,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> JobData {
        self.read().clone()
    }

    pub fn state(&self) -> ExposureState {
        self.read().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Informational warnings that do not block the job.
    pub fn subscribe_warnings(&self) -> broadcast::Receiver<PrinterWarning> {
        self.warnings.subscribe()
    }

    pub fn warning_occurred(&self, warning: PrinterWarning) {
        tracing::warn!("Warning occurred: {}", warning);
        let _ = self.warnings.send(warning);
    }

    /// Stream of changes of a single field.
    pub fn field_changes(&self, field: &'static str) -> impl Stream<Item = Value> + use<> {
        let mut rx = self.events.subscribe();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.field == field => yield event.value,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Change stream for {} lagged by {} events", field, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn publish(&self, field: &'static str, value: Value) {
        // Nobody listening is fine
        let _ = self.events.send(JobEvent { field, value });
    }

    /// Apply `f` and publish the value it returns, unless the job is over.
    fn update(&self, field: &'static str, f: impl FnOnce(&mut JobData) -> Value) -> bool {
        let value = {
            let mut data = self.write();
            if data.state.is_finished() {
                tracing::debug!("Ignoring change of {} in terminal state {}", field, data.state);
                return false;
            }
            f(&mut data)
        };
        self.publish(field, value);
        true
    }

    pub fn set_state(&self, next: ExposureState) -> Result<(), ExposureError> {
        let old = {
            let mut data = self.write();
            let old = data.state;
            if old == next {
                return Ok(());
            }
            if !old.can_transition_to(next) || old.is_finished() {
                return Err(ExposureError::InvalidTransition { from: old, to: next });
            }
            data.state = next;
            old
        };
        tracing::info!("State changed: {} -> {}", old, next);
        self.publish("state", json!(next));
        Ok(())
    }

    /// Terminal result seen by the caller.
    pub fn acknowledge(&self) -> Result<(), ExposureError> {
        let old = {
            let mut data = self.write();
            let old = data.state;
            if !matches!(old, ExposureState::Finished | ExposureState::Canceled | ExposureState::Failure) {
                return Err(ExposureError::NotAvailableInState {
                    state: old,
                    allowed: vec![ExposureState::Finished, ExposureState::Canceled, ExposureState::Failure],
                });
            }
            data.state = ExposureState::Done;
            old
        };
        tracing::info!("State changed: {} -> {}", old, ExposureState::Done);
        self.publish("state", json!(ExposureState::Done));
        Ok(())
    }

    pub fn set_actual_layer(&self, layer: usize) {
        self.update("actual_layer", |d| {
            d.actual_layer = d.actual_layer.max(layer);
            json!(d.actual_layer)
        });
    }

    pub fn set_slow_layers_done(&self, value: usize) {
        self.update("slow_layers_done", |d| {
            d.slow_layers_done = value;
            json!(value)
        });
    }

    pub fn set_tower_position_nm(&self, value: i64) {
        self.update("tower_position_nm", |d| {
            d.tower_position_nm = value;
            json!(value)
        });
    }

    pub fn set_resin_count_ml(&self, value: f64) {
        self.update("resin_count_ml", |d| {
            d.resin_count_ml = value;
            json!(value)
        });
    }

    pub fn set_resin_volume_ml(&self, value: Option<f64>) {
        self.update("resin_volume_ml", |d| {
            d.resin_volume_ml = value;
            json!(value)
        });
    }

    pub fn set_resin_remain_ml(&self, value: Option<f64>) {
        self.update("resin_remain_ml", |d| {
            d.resin_remain_ml = value;
            json!(value)
        });
    }

    pub fn set_resin_warn(&self, value: bool) {
        self.update("resin_warn", |d| {
            d.resin_warn = value;
            json!(value)
        });
    }

    pub fn set_resin_low(&self, value: bool) {
        self.update("resin_low", |d| {
            d.resin_low = value;
            json!(value)
        });
    }

    pub fn set_remaining_wait_sec(&self, value: u32) {
        self.update("remaining_wait_sec", |d| {
            d.remaining_wait_sec = value;
            json!(value)
        });
    }

    pub fn set_estimated_total_time_ms(&self, value: i64) {
        self.update("estimated_total_time_ms", |d| {
            d.estimated_total_time_ms = value;
            json!(value)
        });
    }

    pub fn set_print_start_time(&self, value: DateTime<Utc>) {
        self.update("print_start_time", |d| {
            d.print_start_time = Some(value.trunc_subsecs(6));
            timestamp(d.print_start_time)
        });
    }

    pub fn set_print_end_time(&self, value: DateTime<Utc>) {
        self.update("print_end_time", |d| {
            d.print_end_time = Some(value.trunc_subsecs(6));
            timestamp(d.print_end_time)
        });
    }

    pub fn set_exposure_end(&self, value: Option<DateTime<Utc>>) {
        self.update("exposure_end", |d| {
            d.exposure_end = value.map(|t| t.trunc_subsecs(6));
            timestamp(d.exposure_end)
        });
    }

    pub fn set_check_result(&self, check: ExposureCheck, result: ExposureCheckResult) {
        self.update("check_results", |d| {
            d.check_results.insert(check, result);
            json!(d.check_results)
        });
    }

    pub fn set_warning(&self, warning: Option<PrinterWarning>) {
        self.update("warning", |d| {
            d.warning = warning;
            json!(d.warning.as_ref().map(|w| w.to_string()))
        });
    }

    pub fn set_fatal_error(&self, error: Arc<ExposureError>) {
        self.update("fatal_error", |d| {
            let message = error.to_string();
            d.warning = None;
            d.fatal_error = Some(error);
            json!(message)
        });
    }

    pub fn set_current_area_fill(&self, value: u32) {
        self.update("current_area_fill", |d| {
            d.current_area_fill = value;
            json!(value)
        });
    }

    pub fn set_canceled(&self) {
        self.update("canceled", |d| {
            d.canceled = true;
            json!(true)
        });
    }

    /// Shared access to the job's project.
    pub fn with_project<R>(&self, f: impl FnOnce(&Project) -> R) -> Option<R> {
        let guard = self.project.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f)
    }

    pub fn with_project_mut<R>(&self, f: impl FnOnce(&mut Project) -> R) -> Option<R> {
        let mut guard = self.project.write().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f)
    }

    pub fn set_project(&self, project: Project) {
        let mut guard = self.project.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(project);
    }

    pub fn project(&self) -> Option<Project> {
        self.with_project(Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use futures_util::pin_mut;

    #[test]
    fn test_setters_publish_events() {
        let job = JobState::new();
        let mut rx = job.subscribe();
        job.set_actual_layer(3);
        job.set_check_result(ExposureCheck::Fan, ExposureCheckResult::Running);
        let event = rx.try_recv().unwrap();
        assert_eq!(event, JobEvent { field: "actual_layer", value: json!(3) });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.field, "check_results");
        assert_eq!(event.value, json!({"FAN": "RUNNING"}));
    }

    #[test]
    fn test_actual_layer_never_decreases() {
        let job = JobState::new();
        job.set_actual_layer(5);
        job.set_actual_layer(2);
        assert_eq!(job.snapshot().actual_layer, 5);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let job = JobState::new();
        let err = job.set_state(ExposureState::Printing).unwrap_err();
        assert!(matches!(
            err,
            ExposureError::InvalidTransition { from: ExposureState::Init, to: ExposureState::Printing }
        ));
        assert_eq!(job.state(), ExposureState::Init);
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let job = JobState::new();
        job.set_state(ExposureState::ReadingProject).unwrap();
        job.set_state(ExposureState::Failure).unwrap();
        let mut rx = job.subscribe();
        job.set_actual_layer(7);
        job.set_warning(Some(PrinterWarning::PrintingDirectlyFromMedia));
        assert!(rx.try_recv().is_err());
        let data = job.snapshot();
        assert_eq!(data.actual_layer, 0);
        assert!(data.warning.is_none());
        assert!(job.set_state(ExposureState::Printing).is_err());
        job.acknowledge().unwrap();
        assert_eq!(job.state(), ExposureState::Done);
        assert!(job.acknowledge().is_err());
    }

    #[tokio::test]
    async fn test_field_changes_stream() {
        let job = JobState::new();
        let changes = job.field_changes("remaining_wait_sec");
        pin_mut!(changes);
        job.set_actual_layer(1);
        job.set_remaining_wait_sec(9);
        job.set_remaining_wait_sec(8);
        assert_eq!(changes.next().await, Some(json!(9)));
        assert_eq!(changes.next().await, Some(json!(8)));
    }
}
