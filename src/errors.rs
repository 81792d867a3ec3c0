// src/errors.rs - Fatal errors and recoverable warnings of the exposure engine
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ExposureState;

/// Identifier of a cooling fan, used in fan failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FanId {
    UvLed,
    Blower,
    Rear,
}

impl std::fmt::Display for FanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanId::UvLed => f.write_str("UV LED"),
            FanId::Blower => f.write_str("Blower"),
            FanId::Rear => f.write_str("Rear"),
        }
    }
}

/// Non-fatal conditions that need an explicit confirm or reject.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum PrinterWarning {
    #[error("Ambient temperature too high: {temperature:.1} °C")]
    AmbientTooHot { temperature: f64 },
    #[error("Ambient temperature too low: {temperature:.1} °C")]
    AmbientTooCold { temperature: f64 },
    #[error("Not enough resin: measured {measured_ml:.1} ml, required {required_ml:.1} ml")]
    ResinNotEnough { measured_ml: f64, required_ml: f64 },
    #[error("Expect overheating, failed fans: {fans}")]
    ExpectOverheating { fans: String },
    #[error("Printing directly from media")]
    PrintingDirectlyFromMedia,
    #[error("Project was sliced for a different printer model")]
    PrinterModelMismatch,
    #[error("Project setting out of range: {0}")]
    ProjectSettingsModified(String),
}

/// Failures reported by the tower and tilt axes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AxisError {
    #[error("Tilt homing failed")]
    TiltHomeFailed,
    #[error("Tower homing failed")]
    TowerHomeFailed,
    #[error("Tilt move failed")]
    TiltMoveFailed,
    #[error("Tower move failed")]
    TowerMoveFailed,
    #[error("Unknown motion profile: {0}")]
    UnknownProfile(String),
}

/// Failures of the sensors, fans and UV source behind the hardware facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("UV LED temperature sensor failed: {0}")]
    UvTempSensor(String),
    #[error("Resin measurement failed: {0}")]
    ResinMeasurement(String),
    #[error("Hardware communication failed: {0}")]
    Communication(String),
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Cannot read project '{path}': {reason}")]
    CantRead { path: String, reason: String },
    #[error("Project has no layers")]
    NoLayers,
    #[error("Project exposure time {value} ms out of range {min}..={max} ms")]
    ValueOutOfRange { value: u32, min: u32, max: u32 },
    #[error("Invalid calibration region count: {0}")]
    CalibrationInvalid(u32),
    #[error("Unknown motion profile in exposure profile: {0}")]
    UnknownProfile(String),
    #[error("Project IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Project manifest parse error: {0}")]
    Manifest(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Malformed persisted field '{0}'")]
    Malformed(String),
}

/// Errors that terminate an exposure job.
#[derive(Debug, Error)]
pub enum ExposureError {
    #[error("Printer is not mechanically calibrated")]
    NotMechanicallyCalibrated,
    #[error("Printer is not UV calibrated")]
    NotUvCalibrated,
    #[error("Project error: {0}")]
    Project(#[from] ProjectError),
    #[error("UV LED temperature sensor failed: {0}")]
    UvTempSensorFailed(String),
    #[error("Fan failure: {}", .fans.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", "))]
    FanFailed { fans: Vec<FanId> },
    #[error("Resin measurement failed, measured {volume_ml:.1} ml")]
    ResinMeasureFailed { volume_ml: f64 },
    #[error("Resin too low: {volume_ml:.1} ml, minimum {min_ml:.1} ml")]
    ResinTooLow { volume_ml: f64, min_ml: f64 },
    #[error("Resin too high: {volume_ml:.1} ml, maximum {max_ml:.1} ml")]
    ResinTooHigh { volume_ml: f64, max_ml: f64 },
    #[error("Tilt homing failed")]
    TiltHomeFailed,
    #[error("Tilt failed")]
    TiltFailed,
    #[error("Tower failed")]
    TowerFailed,
    #[error("Tower move failed")]
    TowerMoveFailed,
    #[error("Warning not accepted: {0}")]
    WarningEscalation(PrinterWarning),
    #[error("Action not available in state {state}, allowed: {allowed:?}")]
    NotAvailableInState {
        state: ExposureState,
        allowed: Vec<ExposureState>,
    },
    #[error("No warning is pending")]
    NoPendingWarning,
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: ExposureState, to: ExposureState },
    #[error("Exposure canceled")]
    Canceled,
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Worker terminated unexpectedly: {0}")]
    Worker(String),
}

impl ExposureError {
    /// Tilt and tower faults; raising the platform after them is unsafe.
    pub fn is_motion_fault(&self) -> bool {
        matches!(
            self,
            ExposureError::TiltHomeFailed
                | ExposureError::TiltFailed
                | ExposureError::TowerFailed
                | ExposureError::TowerMoveFailed
        )
    }

    /// Errors that end a job as canceled rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExposureError::Canceled | ExposureError::WarningEscalation(_))
    }
}

impl From<AxisError> for ExposureError {
    fn from(err: AxisError) -> Self {
        match err {
            AxisError::TiltHomeFailed => ExposureError::TiltHomeFailed,
            AxisError::TiltMoveFailed => ExposureError::TiltFailed,
            AxisError::TowerHomeFailed => ExposureError::TowerFailed,
            AxisError::TowerMoveFailed => ExposureError::TowerMoveFailed,
            AxisError::UnknownProfile(name) => ExposureError::Project(ProjectError::UnknownProfile(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExposureError::TiltHomeFailed.is_motion_fault());
        assert!(ExposureError::TowerMoveFailed.is_motion_fault());
        assert!(!ExposureError::ResinTooLow { volume_ml: 10.0, min_ml: 68.5 }.is_motion_fault());
        assert!(ExposureError::Canceled.is_cancellation());
        assert!(ExposureError::WarningEscalation(PrinterWarning::PrintingDirectlyFromMedia).is_cancellation());
        assert!(!ExposureError::TowerFailed.is_cancellation());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = ExposureError::ResinTooLow { volume_ml: 40.0, min_ml: 68.5 };
        assert_eq!(err.to_string(), "Resin too low: 40.0 ml, minimum 68.5 ml");
        let err = ExposureError::FanFailed { fans: vec![FanId::UvLed, FanId::Rear] };
        assert_eq!(err.to_string(), "Fan failure: UV LED, Rear");
    }

    #[test]
    fn test_axis_error_mapping() {
        assert!(matches!(ExposureError::from(AxisError::TiltHomeFailed), ExposureError::TiltHomeFailed));
        assert!(matches!(ExposureError::from(AxisError::TowerMoveFailed), ExposureError::TowerMoveFailed));
    }
}
