// src/exposure/persistence.rs - Save and restore of the last job
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use super::data::JobData;
use crate::errors::{ExposureError, PersistenceError};
use crate::project::{Project, ProjectData, ProjectStore};
use crate::state::ExposureState;

const DATETIME_TAG: &str = "datetime:";
const STATE_TAG: &str = "ExposureState:";

fn encode_datetime(map: &mut Map<String, Value>, key: &str, value: Option<DateTime<Utc>>) {
    if let Some(t) = value {
        map.insert(format!("{DATETIME_TAG}{key}"), json!(t.timestamp_micros() as f64 / 1e6));
    }
}

fn decode_datetime(key: &str, value: &Value) -> Result<DateTime<Utc>, PersistenceError> {
    let seconds = value.as_f64().ok_or_else(|| PersistenceError::Malformed(key.to_string()))?;
    DateTime::from_timestamp_micros((seconds * 1e6).round() as i64)
        .ok_or_else(|| PersistenceError::Malformed(key.to_string()))
}

fn field<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, PersistenceError> {
    serde_json::from_value(value.clone()).map_err(|_| PersistenceError::Malformed(key.to_string()))
}

/// Flat JSON record of the persisted job fields. Timestamps and states
/// carry their kind in the key, the project's mutable fields are nested
/// under `project`.
pub fn encode(data: &JobData, project: &ProjectData) -> Result<Value, PersistenceError> {
    let mut map = Map::new();
    map.insert(format!("{STATE_TAG}state"), json!(data.state));
    map.insert("actual_layer".to_string(), json!(data.actual_layer));
    map.insert("slow_layers_done".to_string(), json!(data.slow_layers_done));
    map.insert("tower_position_nm".to_string(), json!(data.tower_position_nm));
    map.insert("resin_count_ml".to_string(), json!(data.resin_count_ml));
    map.insert("resin_volume_ml".to_string(), json!(data.resin_volume_ml));
    map.insert("resin_remain_ml".to_string(), json!(data.resin_remain_ml));
    map.insert("resin_warn".to_string(), json!(data.resin_warn));
    map.insert("resin_low".to_string(), json!(data.resin_low));
    map.insert("estimated_total_time_ms".to_string(), json!(data.estimated_total_time_ms));
    map.insert("current_area_fill".to_string(), json!(data.current_area_fill));
    map.insert("remaining_wait_sec".to_string(), json!(data.remaining_wait_sec));
    map.insert("canceled".to_string(), json!(data.canceled));
    encode_datetime(&mut map, "print_start_time", data.print_start_time);
    encode_datetime(&mut map, "print_end_time", data.print_end_time);
    encode_datetime(&mut map, "exposure_end", data.exposure_end);
    map.insert("project".to_string(), serde_json::to_value(project)?);
    Ok(Value::Object(map))
}

pub fn decode(value: Value) -> Result<(JobData, ProjectData), PersistenceError> {
    let Value::Object(mut map) = value else {
        return Err(PersistenceError::Malformed("root".to_string()));
    };
    let project: ProjectData = map
        .remove("project")
        .ok_or_else(|| PersistenceError::Malformed("project".to_string()))
        .and_then(|v| Ok(serde_json::from_value(v)?))?;

    let mut data = JobData::default();
    for (key, value) in &map {
        if let Some(name) = key.strip_prefix(DATETIME_TAG) {
            let t = Some(decode_datetime(key, value)?);
            match name {
                "print_start_time" => data.print_start_time = t,
                "print_end_time" => data.print_end_time = t,
                "exposure_end" => data.exposure_end = t,
                _ => tracing::warn!("Ignoring unknown persisted field {}", key),
            }
            continue;
        }
        if let Some(name) = key.strip_prefix(STATE_TAG) {
            match name {
                "state" => data.state = field::<ExposureState>(key, value)?,
                _ => tracing::warn!("Ignoring unknown persisted field {}", key),
            }
            continue;
        }
        match key.as_str() {
            "actual_layer" => data.actual_layer = field(key, value)?,
            "slow_layers_done" => data.slow_layers_done = field(key, value)?,
            "tower_position_nm" => data.tower_position_nm = field(key, value)?,
            "resin_count_ml" => data.resin_count_ml = field(key, value)?,
            "resin_volume_ml" => data.resin_volume_ml = field(key, value)?,
            "resin_remain_ml" => data.resin_remain_ml = field(key, value)?,
            "resin_warn" => data.resin_warn = field(key, value)?,
            "resin_low" => data.resin_low = field(key, value)?,
            "estimated_total_time_ms" => data.estimated_total_time_ms = field(key, value)?,
            "current_area_fill" => data.current_area_fill = field(key, value)?,
            "remaining_wait_sec" => data.remaining_wait_sec = field(key, value)?,
            "canceled" => data.canceled = field(key, value)?,
            _ => tracing::warn!("Ignoring unknown persisted field {}", key),
        }
    }
    Ok((data, project))
}

/// Persists the last job to a well-known file.
#[derive(Debug, Clone)]
pub struct ExposurePickler {
    path: PathBuf,
}

impl ExposurePickler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, data: &JobData, project: &ProjectData) -> Result<(), PersistenceError> {
        tracing::debug!("Saving exposure data to '{}'", self.path.display());
        let value = encode(data, project)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&value)?)?;
        Ok(())
    }

    /// `None` when nothing was saved.
    pub fn load_data(&self) -> Result<Option<(JobData, ProjectData)>, PersistenceError> {
        tracing::debug!("Loading exposure data from '{}'", self.path.display());
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No saved exposure");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&contents)?;
        decode(value).map(Some)
    }

    /// Load the saved job and re-open its project by path.
    pub async fn load(&self, store: &dyn ProjectStore) -> Result<Option<(JobData, Project)>, ExposureError> {
        let Some((data, project_data)) = self.load_data()? else {
            return Ok(None);
        };
        let mut project = store.open(&project_data.path).await?;
        project.restore_persistent_data(project_data);
        Ok(Some((data, project)))
    }

    pub fn cleanup_last_data(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ExposureProfile;
    use tempfile::tempdir;

    fn project_data() -> ProjectData {
        ProjectData {
            path: "/var/sl1fw/previous-prints/numbers.toml".to_string(),
            exposure_time_ms: 2500,
            exposure_time_first_ms: 30_000,
            calibrate_time_ms: 0,
            calibrate_regions: 0,
            exposure_profile: ExposureProfile::default(),
        }
    }

    #[test]
    fn test_tagged_keys() {
        let data = JobData {
            state: ExposureState::Finished,
            print_start_time: DateTime::from_timestamp_micros(1_700_000_000_123_456),
            ..JobData::default()
        };
        let value = encode(&data, &project_data()).unwrap();
        assert_eq!(value["ExposureState:state"], json!("FINISHED"));
        assert_eq!(value["datetime:print_start_time"], json!(1_700_000_000.123_456));
        assert!(value.get("datetime:print_end_time").is_none());
        assert_eq!(value["project"]["exposure_time_ms"], json!(2500));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let pickler = ExposurePickler::new(dir.path().join("last_project.json"));
        let data = JobData {
            state: ExposureState::Canceled,
            actual_layer: 42,
            slow_layers_done: 13,
            tower_position_nm: 2_150_000,
            resin_count_ml: 17.25,
            resin_volume_ml: Some(150.0),
            resin_remain_ml: Some(132.75),
            resin_warn: false,
            resin_low: false,
            estimated_total_time_ms: 3_600_000,
            print_start_time: DateTime::from_timestamp_micros(1_700_000_000_000_001),
            print_end_time: DateTime::from_timestamp_micros(1_700_003_600_500_000),
            current_area_fill: 12,
            remaining_wait_sec: 7,
            canceled: true,
            ..JobData::default()
        };
        pickler.save(&data, &project_data()).unwrap();
        let (loaded, project) = pickler.load_data().unwrap().unwrap();
        assert_eq!(project, project_data());
        assert_eq!(loaded.state, data.state);
        assert_eq!(loaded.actual_layer, 42);
        assert_eq!(loaded.slow_layers_done, 13);
        assert_eq!(loaded.tower_position_nm, 2_150_000);
        assert_eq!(loaded.resin_count_ml, 17.25);
        assert_eq!(loaded.resin_volume_ml, Some(150.0));
        assert_eq!(loaded.resin_remain_ml, Some(132.75));
        assert_eq!(loaded.estimated_total_time_ms, 3_600_000);
        assert_eq!(loaded.print_start_time, data.print_start_time);
        assert_eq!(loaded.print_end_time, data.print_end_time);
        assert_eq!(loaded.exposure_end, None);
        assert_eq!(loaded.remaining_wait_sec, 7);
        assert!(loaded.canceled);

        pickler.cleanup_last_data().unwrap();
        assert!(pickler.load_data().unwrap().is_none());
        pickler.cleanup_last_data().unwrap();
    }

    #[test]
    fn test_malformed_state_rejected() {
        let value = json!({ "ExposureState:state": "LEVITATING", "project": project_data() });
        assert!(matches!(decode(value), Err(PersistenceError::Malformed(key)) if key == "ExposureState:state"));
    }
}
