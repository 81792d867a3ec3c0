// src/lib.rs - Exposure engine of an SLA resin printer
pub mod config;
pub mod errors;
pub mod exposure;
pub mod hardware;
pub mod project;
pub mod simulator;
pub mod state;

pub use config::Config;
pub use errors::{ExposureError, PrinterWarning};
pub use exposure::{Exposure, JobId, JobRegistry, PrinterContext};
pub use state::ExposureState;
