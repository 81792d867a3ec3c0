// src/exposure/gate.rs - Blocking confirm/reject rendezvous for printer warnings
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use super::CancelToken;
use super::data::JobState;
use crate::errors::{ExposureError, PrinterWarning};
use crate::hardware::PowerLed;
use crate::state::ExposureState;

/// Holds at most one pending warning. Raisers queue up behind the pending
/// one and each blocks until its own warning is resolved.
#[derive(Debug)]
pub struct WarningGate {
    turn: tokio::sync::Mutex<()>,
    pending: Mutex<Option<oneshot::Sender<bool>>>,
    led: Arc<PowerLed>,
}

impl WarningGate {
    pub fn new(led: Arc<PowerLed>) -> Self {
        Self {
            turn: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            led,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Publish `warning` and wait for the caller's decision.
    ///
    /// Returns `WarningEscalation` when rejected and `Canceled` when the job
    /// is canceled while waiting.
    pub async fn raise(
        &self,
        job: &JobState,
        warning: PrinterWarning,
        cancel: &CancelToken,
    ) -> Result<(), ExposureError> {
        let _turn = self.turn.lock().await;
        let prior = job.state();
        tracing::warn!("Warning raised in state {}: {}", prior, warning);
        let _indicator = self.led.warning_scope();
        // The reply slot is armed before anyone can observe CHECK_WARNING
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(tx);
        }
        job.set_warning(Some(warning.clone()));
        if let Err(e) = job.set_state(ExposureState::CheckWarning) {
            self.clear();
            job.set_warning(None);
            return Err(e);
        }

        let decision = tokio::select! {
            decision = rx => decision.unwrap_or(false),
            _ = cancel.cancelled() => {
                self.clear();
                job.set_warning(None);
                return Err(ExposureError::Canceled);
            }
        };

        if decision {
            tracing::info!("Warning confirmed: {}", warning);
            job.set_warning(None);
            job.set_state(prior)?;
            Ok(())
        } else {
            tracing::error!("Warning rejected: {}", warning);
            Err(ExposureError::WarningEscalation(warning))
        }
    }

    fn resolve(&self, confirmed: bool) -> bool {
        let sender = self.pending.lock().ok().and_then(|mut p| p.take());
        match sender {
            Some(tx) => tx.send(confirmed).is_ok(),
            None => false,
        }
    }

    /// Returns false when no warning was pending.
    pub fn confirm(&self) -> bool {
        self.resolve(true)
    }

    pub fn reject(&self) -> bool {
        self.resolve(false)
    }

    fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }
}
