// src/exposure/stats.rs - Lifetime print statistics stored as TOML
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::PersistenceError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintStatistics {
    #[serde(default)]
    pub started_projects: u64,
    #[serde(default)]
    pub finished_projects: u64,
    #[serde(default)]
    pub layers: u64,
    #[serde(default)]
    pub total_seconds: u64,
    /// Resin used by all prints, in ml.
    #[serde(default)]
    pub total_resin: f64,
}

impl PrintStatistics {
    /// A missing file yields zeroed statistics.
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }

    pub fn record_start(path: &Path) -> Result<Self, PersistenceError> {
        let mut stats = Self::load(path)?;
        stats.started_projects += 1;
        stats.save(path)?;
        Ok(stats)
    }

    pub fn record_finish(
        path: &Path,
        finished: bool,
        layers: u64,
        seconds: u64,
        resin_ml: f64,
    ) -> Result<Self, PersistenceError> {
        let mut stats = Self::load(path)?;
        if finished {
            stats.finished_projects += 1;
        }
        stats.layers += layers;
        stats.total_seconds += seconds;
        stats.total_resin += resin_ml;
        stats.save(path)?;
        tracing::info!(
            "Statistics updated: {} started, {} finished, {} layers, {} s, {:.1} ml",
            stats.started_projects,
            stats.finished_projects,
            stats.layers,
            stats.total_seconds,
            stats.total_resin
        );
        Ok(stats)
    }
}
