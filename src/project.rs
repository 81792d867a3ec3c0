// src/project.rs - Print project: layers, exposure times and motion profiles
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{PrinterWarning, ProjectError};
use crate::hardware::ProfileSet;

pub const EXPOSURE_TIME_MIN_MS: u32 = 100;
pub const EXPOSURE_TIME_MAX_MS: u32 = 60_000;
pub const EXPOSURE_TIME_FIRST_MAX_MS: u32 = 120_000;
pub const EXPOSURE_TIME_CALIBRATE_MAX_MS: u32 = 5_000;
pub const FIRST_EXTRA_SLOW_LAYERS: usize = 3;
const CALIBRATE_REGIONS: [u32; 7] = [0, 2, 4, 6, 8, 9, 10];

/// Motion and delay settings used to peel one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerProfile {
    pub delay_before_exposure_ms: u64,
    pub delay_after_exposure_ms: u64,
    pub tower_hop_height_nm: i64,
    pub tower_profile: String,
    pub use_tilt: bool,
    pub tilt_down_initial_profile: String,
    pub tilt_down_offset_steps: i64,
    pub tilt_down_offset_delay_ms: u64,
    pub tilt_down_finish_profile: String,
    pub tilt_down_cycles: u32,
    pub tilt_down_delay_ms: u64,
    pub tilt_up_initial_profile: String,
    pub tilt_up_offset_steps: i64,
    pub tilt_up_offset_delay_ms: u64,
    pub tilt_up_finish_profile: String,
    pub tilt_up_cycles: u32,
    pub tilt_up_delay_ms: u64,
}

impl LayerProfile {
    /// Profile used for layers with a small lit area.
    pub fn fast() -> Self {
        Self {
            delay_before_exposure_ms: 0,
            delay_after_exposure_ms: 0,
            tower_hop_height_nm: 0,
            tower_profile: "layer22".to_string(),
            use_tilt: true,
            tilt_down_initial_profile: "layerMoveFast".to_string(),
            tilt_down_offset_steps: 0,
            tilt_down_offset_delay_ms: 0,
            tilt_down_finish_profile: "layerMoveFast".to_string(),
            tilt_down_cycles: 1,
            tilt_down_delay_ms: 0,
            tilt_up_initial_profile: "layerMoveFast".to_string(),
            tilt_up_offset_steps: 1200,
            tilt_up_offset_delay_ms: 0,
            tilt_up_finish_profile: "layerMoveSlow".to_string(),
            tilt_up_cycles: 1,
            tilt_up_delay_ms: 0,
        }
    }

    /// Profile used for layers with a large lit area.
    pub fn slow() -> Self {
        Self {
            delay_before_exposure_ms: 1000,
            delay_after_exposure_ms: 0,
            tower_hop_height_nm: 0,
            tower_profile: "layer22".to_string(),
            use_tilt: true,
            tilt_down_initial_profile: "layerMoveSlow".to_string(),
            tilt_down_offset_steps: 650,
            tilt_down_offset_delay_ms: 1000,
            tilt_down_finish_profile: "layerMoveSlow".to_string(),
            tilt_down_cycles: 1,
            tilt_down_delay_ms: 0,
            tilt_up_initial_profile: "layerMoveSlow".to_string(),
            tilt_up_offset_steps: 1200,
            tilt_up_offset_delay_ms: 0,
            tilt_up_finish_profile: "layerMoveSlow".to_string(),
            tilt_up_cycles: 1,
            tilt_up_delay_ms: 0,
        }
    }

    /// Check every referenced stepper profile exists on its axis.
    pub fn validate(&self, tilt: &ProfileSet, tower: &ProfileSet) -> Result<(), ProjectError> {
        if !tower.contains(&self.tower_profile) {
            return Err(ProjectError::UnknownProfile(self.tower_profile.clone()));
        }
        for name in [
            &self.tilt_down_initial_profile,
            &self.tilt_down_finish_profile,
            &self.tilt_up_initial_profile,
            &self.tilt_up_finish_profile,
        ] {
            if !tilt.contains(name) {
                return Err(ProjectError::UnknownProfile(name.clone()));
            }
        }
        Ok(())
    }
}

/// Area-fill threshold plus the two layer profiles it selects between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureProfile {
    /// Lit area in percent above which the slow profile is used.
    pub area_fill: u32,
    pub below_area_fill: LayerProfile,
    pub above_area_fill: LayerProfile,
}

impl Default for ExposureProfile {
    fn default() -> Self {
        Self {
            area_fill: 45,
            below_area_fill: LayerProfile::fast(),
            above_area_fill: LayerProfile::slow(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectLayer {
    pub image: String,
    pub height_nm: i64,
    /// One entry per sub-exposure, more than one for calibration projects.
    pub times_ms: Vec<u32>,
}

impl ProjectLayer {
    pub fn exposure_ms(&self) -> u64 {
        self.times_ms.iter().map(|t| u64::from(*t)).sum()
    }
}

/// Mutable project fields that survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectData {
    pub path: String,
    pub exposure_time_ms: u32,
    pub exposure_time_first_ms: u32,
    pub calibrate_time_ms: u32,
    pub calibrate_regions: u32,
    pub exposure_profile: ExposureProfile,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub data: ProjectData,
    pub layers: Vec<ProjectLayer>,
    pub fade_layers: usize,
    pub layers_slow: usize,
    pub layers_fast: usize,
    pub layer_height_nm: i64,
    pub total_height_nm: i64,
    pub used_material_nl: u64,
    pub warnings: Vec<PrinterWarning>,
    pub calibrate_time_ms_exact: Vec<u32>,
}

/// On-disk description of a project.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectManifest {
    pub name: String,
    pub exposure_time_ms: u32,
    pub exposure_time_first_ms: u32,
    #[serde(default)]
    pub calibrate_time_ms: u32,
    #[serde(default)]
    pub calibrate_regions: u32,
    #[serde(default)]
    pub calibrate_time_ms_exact: Vec<u32>,
    #[serde(default = "default_fade_layers")]
    pub fade_layers: usize,
    #[serde(default)]
    pub layers_slow: usize,
    #[serde(default)]
    pub layers_fast: usize,
    #[serde(default)]
    pub used_material_ml: f64,
    #[serde(default)]
    pub printer_model: Option<String>,
    #[serde(default)]
    pub exposure_profile: ExposureProfile,
    #[serde(default)]
    pub layers: Vec<ManifestLayer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestLayer {
    pub image: String,
    pub height_nm: i64,
}

fn default_fade_layers() -> usize { 10 }

fn check_range(value: u32, min: u32, max: u32) -> Result<u32, ProjectError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ProjectError::ValueOutOfRange { value, min, max })
    }
}

impl Project {
    pub fn from_manifest(manifest: ProjectManifest, path: &str) -> Result<Self, ProjectError> {
        if manifest.layers.is_empty() {
            return Err(ProjectError::NoLayers);
        }
        if !CALIBRATE_REGIONS.contains(&manifest.calibrate_regions) {
            return Err(ProjectError::CalibrationInvalid(manifest.calibrate_regions));
        }
        let mut warnings = Vec::new();
        let exposure_time_ms =
            clamp_with_warning(manifest.exposure_time_ms, EXPOSURE_TIME_MIN_MS, EXPOSURE_TIME_MAX_MS, "exposure_time_ms", &mut warnings);
        let exposure_time_first_ms = clamp_with_warning(
            manifest.exposure_time_first_ms,
            EXPOSURE_TIME_MIN_MS,
            EXPOSURE_TIME_FIRST_MAX_MS,
            "exposure_time_first_ms",
            &mut warnings,
        );
        let calibrate_time_ms = if manifest.calibrate_regions > 0 {
            clamp_with_warning(
                manifest.calibrate_time_ms,
                EXPOSURE_TIME_MIN_MS,
                EXPOSURE_TIME_CALIBRATE_MAX_MS,
                "calibrate_time_ms",
                &mut warnings,
            )
        } else {
            manifest.calibrate_time_ms
        };

        let layers: Vec<ProjectLayer> = manifest
            .layers
            .into_iter()
            .map(|l| ProjectLayer { image: l.image, height_nm: l.height_nm, times_ms: Vec::new() })
            .collect();
        let total_height_nm = layers.iter().map(|l| l.height_nm).sum();
        let layer_height_nm = layers.get(1).or(layers.first()).map(|l| l.height_nm).unwrap_or(0);
        let layers_fast = if manifest.layers_slow + manifest.layers_fast == layers.len() {
            manifest.layers_fast
        } else {
            layers.len().saturating_sub(manifest.layers_slow)
        };

        let mut project = Self {
            name: manifest.name,
            data: ProjectData {
                path: path.to_string(),
                exposure_time_ms,
                exposure_time_first_ms,
                calibrate_time_ms,
                calibrate_regions: manifest.calibrate_regions,
                exposure_profile: manifest.exposure_profile,
            },
            layers,
            fade_layers: manifest.fade_layers,
            layers_slow: manifest.layers_slow,
            layers_fast,
            layer_height_nm,
            total_height_nm,
            used_material_nl: (manifest.used_material_ml * 1e6) as u64,
            warnings,
            calibrate_time_ms_exact: manifest.calibrate_time_ms_exact,
        };
        if project.data.calibrate_regions > 0 {
            project.used_material_nl *= u64::from(project.data.calibrate_regions);
        }
        project.fill_layers_times();
        Ok(project)
    }

    pub fn path(&self) -> &str {
        &self.data.path
    }

    pub fn total_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn used_material_ml(&self) -> f64 {
        self.used_material_nl as f64 / 1e6
    }

    pub fn first_slow_layers(&self) -> usize {
        self.fade_layers + FIRST_EXTRA_SLOW_LAYERS
    }

    pub fn exposure_profile(&self) -> &ExposureProfile {
        &self.data.exposure_profile
    }

    pub fn set_exposure_time_ms(&mut self, value: u32) -> Result<(), ProjectError> {
        self.data.exposure_time_ms = check_range(value, EXPOSURE_TIME_MIN_MS, EXPOSURE_TIME_MAX_MS)?;
        self.fill_layers_times();
        Ok(())
    }

    pub fn set_exposure_time_first_ms(&mut self, value: u32) -> Result<(), ProjectError> {
        self.data.exposure_time_first_ms = check_range(value, EXPOSURE_TIME_MIN_MS, EXPOSURE_TIME_FIRST_MAX_MS)?;
        self.fill_layers_times();
        Ok(())
    }

    pub fn set_calibrate_time_ms(&mut self, value: u32) -> Result<(), ProjectError> {
        self.data.calibrate_time_ms = check_range(value, EXPOSURE_TIME_MIN_MS, EXPOSURE_TIME_CALIBRATE_MAX_MS)?;
        self.fill_layers_times();
        Ok(())
    }

    pub fn set_calibrate_regions(&mut self, value: u32) -> Result<(), ProjectError> {
        if !CALIBRATE_REGIONS.contains(&value) {
            tracing::error!("calibrate_regions - value {} not in {:?}", value, CALIBRATE_REGIONS);
            return Err(ProjectError::CalibrationInvalid(value));
        }
        self.data.calibrate_regions = value;
        self.fill_layers_times();
        Ok(())
    }

    pub fn set_exposure_profile(&mut self, profile: ExposureProfile) {
        self.data.exposure_profile = profile;
    }

    /// Replace the persisted fields, e.g. after loading a saved job.
    pub fn restore_persistent_data(&mut self, data: ProjectData) {
        self.data = data;
        self.fill_layers_times();
    }

    /// First layer gets the first-layer time, faded layers step down linearly
    /// to the normal time, calibration projects fan out per region.
    fn fill_layers_times(&mut self) {
        let first = f64::from(self.data.exposure_time_first_ms);
        let normal = self.data.exposure_time_ms;
        let time_loss = if self.fade_layers > 1 {
            (first - f64::from(normal)) / (self.fade_layers - 1) as f64
        } else {
            0.0
        };
        let regions = self.data.calibrate_regions as usize;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let t = if i == 0 {
                self.data.exposure_time_first_ms
            } else if i + 1 < self.fade_layers {
                (first - i as f64 * time_loss) as u32
            } else {
                normal
            };
            layer.times_ms = if regions > 0 {
                if self.calibrate_time_ms_exact.is_empty() {
                    std::iter::once(t)
                        .chain(std::iter::repeat_n(self.data.calibrate_time_ms, regions - 1))
                        .collect()
                } else {
                    self.calibrate_time_ms_exact.clone()
                }
            } else {
                vec![t]
            };
        }
    }
}

fn clamp_with_warning(value: u32, min: u32, max: u32, name: &str, warnings: &mut Vec<PrinterWarning>) -> u32 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        tracing::warn!("Project {} {} out of range, using {}", name, value, clamped);
        warnings.push(PrinterWarning::ProjectSettingsModified(format!("{}: {} -> {}", name, value, clamped)));
    }
    clamped
}

/// Opens projects and prepares them for printing.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn open(&self, path: &str) -> Result<Project, ProjectError>;
    /// Copy the project next to previous prints and re-validate it there.
    async fn copy_and_check(&self, project: &mut Project, previous_prints: &Path) -> Result<(), ProjectError>;
}

/// Reads TOML project manifests.
#[derive(Debug, Clone, Default)]
pub struct ManifestProjectStore {
    printer_model: Option<String>,
}

impl ManifestProjectStore {
    pub fn new(printer_model: Option<String>) -> Self {
        Self { printer_model }
    }
}

#[async_trait]
impl ProjectStore for ManifestProjectStore {
    async fn open(&self, path: &str) -> Result<Project, ProjectError> {
        tracing::info!("Reading project manifest: {}", path);
        let content = tokio::fs::read_to_string(path).await.map_err(|e| ProjectError::CantRead {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let manifest: ProjectManifest = toml::from_str(&content)?;
        let model_mismatch = match (&self.printer_model, &manifest.printer_model) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        };
        let mut project = Project::from_manifest(manifest, path)?;
        if model_mismatch {
            project.warnings.push(PrinterWarning::PrinterModelMismatch);
        }
        Ok(project)
    }

    async fn copy_and_check(&self, project: &mut Project, previous_prints: &Path) -> Result<(), ProjectError> {
        let origin = PathBuf::from(project.path());
        if origin.parent() == Some(previous_prints) {
            return Ok(());
        }
        let file_name = origin.file_name().ok_or_else(|| ProjectError::CantRead {
            path: project.path().to_string(),
            reason: "no file name".to_string(),
        })?;
        tokio::fs::create_dir_all(previous_prints).await?;
        let target = previous_prints.join(file_name);
        tokio::fs::copy(&origin, &target).await?;
        let target_str = target.to_string_lossy().to_string();
        // The copy must parse the same way as the origin
        let copied = self.open(&target_str).await?;
        if copied.total_layers() != project.total_layers() {
            return Err(ProjectError::CantRead {
                path: target_str,
                reason: "copied project differs from origin".to_string(),
            });
        }
        project.data.path = target_str;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn manifest(layers: usize) -> ProjectManifest {
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
                .map(|i| ManifestLayer { image: format!("numbers{:05}.png", i), height_nm: 50_000 })
                .collect(),
        }
    }

    #[test]
    fn test_fade_layers_interpolate() {
        let mut m = manifest(6);
        m.exposure_time_first_ms = 2000;
        m.exposure_time_ms = 1000;
        m.fade_layers = 3;
        let project = Project::from_manifest(m, "/tmp/numbers.toml").unwrap();
        let times: Vec<u32> = project.layers.iter().map(|l| l.times_ms[0]).collect();
        assert_eq!(times, vec![2000, 1500, 1000, 1000, 1000, 1000]);
        assert_eq!(project.first_slow_layers(), 6);
        assert_eq!(project.total_height_nm, 300_000);
    }

    #[test]
    fn test_calibration_fan_out() {
        let mut m = manifest(2);
        m.calibrate_regions = 4;
        m.calibrate_time_ms = 500;
        let project = Project::from_manifest(m, "p.toml").unwrap();
        assert_eq!(project.layers[0].times_ms, vec![1000, 500, 500, 500]);
        assert_eq!(project.layers[1].exposure_ms(), 2500);
        assert_eq!(project.used_material_nl, 20_000_000);
    }

    #[test]
    fn test_setters_range_checked() {
        let mut project = Project::from_manifest(manifest(2), "p.toml").unwrap();
        assert!(matches!(
            project.set_exposure_time_ms(50),
            Err(ProjectError::ValueOutOfRange { value: 50, .. })
        ));
        assert_eq!(project.data.exposure_time_ms, 1000);
        project.set_exposure_time_ms(3000).unwrap();
        assert_eq!(project.layers[1].times_ms, vec![3000]);
        assert!(project.set_calibrate_regions(3).is_err());
    }

    #[test]
    fn test_out_of_range_manifest_values_raise_warning() {
        let mut m = manifest(1);
        m.exposure_time_ms = 90_000;
        let project = Project::from_manifest(m, "p.toml").unwrap();
        assert_eq!(project.data.exposure_time_ms, EXPOSURE_TIME_MAX_MS);
        assert_eq!(project.warnings.len(), 1);
    }

    #[test]
    fn test_empty_project_rejected() {
        assert!(matches!(Project::from_manifest(manifest(0), "p.toml"), Err(ProjectError::NoLayers)));
    }

    #[tokio::test]
    async fn test_manifest_store_copy_and_check() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("numbers.toml");
        std::fs::write(&origin, toml::to_string(&manifest(3)).unwrap()).unwrap();
        let store = ManifestProjectStore::new(Some("SL1".to_string()));
        let mut project = store.open(origin.to_str().unwrap()).await.unwrap();
        assert_eq!(project.total_layers(), 3);
        let previous = dir.path().join("previous-prints");
        store.copy_and_check(&mut project, &previous).await.unwrap();
        assert!(previous.join("numbers.toml").exists());
        assert!(project.path().ends_with("previous-prints/numbers.toml"));
    }
}
