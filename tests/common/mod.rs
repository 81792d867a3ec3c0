// tests/common/mod.rs - Shared fixtures for exposure scenarios
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use resin_rs::config::{Config, PathsConfig};
use resin_rs::project::{ExposureProfile, ManifestLayer, ManifestProjectStore, ProjectManifest};
use resin_rs::simulator::VirtualPrinter;
use resin_rs::{Exposure, ExposureState, PrinterContext};

pub const LAYER_HEIGHT_NM: i64 = 50_000;

pub fn manifest(layers: usize) -> ProjectManifest {
    ProjectManifest {
        name: "numbers".to_string(),
        exposure_time_ms: 1000,
        exposure_time_first_ms: 1000,
        calibrate_time_ms: 0,
        calibrate_regions: 0,
        calibrate_time_ms_exact: Vec::new(),
        fade_layers: 10,
        layers_slow: 0,
        layers_fast: layers,
        used_material_ml: 5.0,
        printer_model: None,
        exposure_profile: ExposureProfile::default(),
        layers: (0..layers)
            .map(|i| ManifestLayer { image: format!("numbers{:05}.png", i), height_nm: LAYER_HEIGHT_NM })
            .collect(),
    }
}

pub struct Bench {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub printer: VirtualPrinter,
    pub project: String,
}

impl Bench {
    pub fn new(layers: usize) -> Self {
        Self::with(layers, |_| {}, |_| {})
    }

    pub fn with(
        layers: usize,
        configure: impl FnOnce(&mut Config),
        edit: impl FnOnce(&mut ProjectManifest),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths = PathsConfig::under(dir.path());
        configure(&mut config);
        let mut m = manifest(layers);
        edit(&mut m);
        let project = write_manifest(dir.path(), &m);
        let printer = VirtualPrinter::new(&config);
        Self {
            dir,
            config: Arc::new(config),
            printer,
            project,
        }
    }

    pub fn context(&self) -> PrinterContext {
        self.printer
            .context(self.config.clone(), Arc::new(ManifestProjectStore::new(None)))
    }

    pub fn exposure(&self) -> Exposure {
        Exposure::new(self.context())
    }

    /// Load the project and start the worker; returns once the resin is in.
    pub async fn start(&self) -> Exposure {
        let exposure = self.exposure();
        exposure.read_project(&self.project).await.unwrap();
        exposure.confirm_start().unwrap();
        wait_for_state(&exposure, ExposureState::PourInResin).await;
        exposure.confirm_resin_in().unwrap();
        exposure
    }
}

pub fn write_manifest(dir: &Path, manifest: &ProjectManifest) -> String {
    let path = dir.join("numbers.toml");
    std::fs::write(&path, toml::to_string(manifest).unwrap()).unwrap();
    path.to_string_lossy().to_string()
}

/// Poll until the job reaches `state`. Panics after an hour of virtual time.
pub async fn wait_for_state(exposure: &Exposure, state: ExposureState) {
    let reached = tokio::time::timeout(Duration::from_secs(3600), async {
        while exposure.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "state {} never reached, stuck in {}", state, exposure.state());
}

/// Wait for the worker to exit and return the terminal state.
pub async fn finish(exposure: &Exposure) -> ExposureState {
    tokio::time::timeout(Duration::from_secs(4 * 3600), exposure.join())
        .await
        .expect("worker did not exit")
        .unwrap();
    exposure.state()
}
