//! Recorded motion datasets and their storage.
//!
//! A [`Dataset`] is a table sampled at a fixed interval: one column per
//! joint, degrees for revolute joints and speed for continuous ones.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;
use crate::integrator::JointState;
use crate::joint::{JointKind, JointRegistry, ServoId};

pub const DATASET_VERSION: &str = "1.0";

/// Default sampling interval, in milliseconds.
pub const RECORDING_INTERVAL_MS: u64 = 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointColumn {
    pub servo_id: ServoId,
    pub name: String,
    pub kind: JointKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub name: String,
    pub version: String,
    pub created_at_ms: u64,
    pub recording_interval_ms: u64,
    pub duration_ms: f64,
    pub joints: Vec<JointColumn>,
    pub frames: Vec<Vec<f64>>,
}

impl Dataset {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Listing entry returned by [`DatasetStore::list`].
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetInfo {
    pub id: String,
    pub name: String,
    pub created_at_ms: u64,
    pub frame_count: usize,
    pub duration_ms: f64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Samples joint snapshots into frames.
#[derive(Debug)]
pub struct Recorder {
    columns: Vec<JointColumn>,
    interval_ms: u64,
    frames: Vec<Vec<f64>>,
    first_ms: Option<f64>,
    last_ms: f64,
}

impl Recorder {
    pub fn new(registry: &JointRegistry, interval_ms: u64) -> Self {
        let columns = registry
            .all()
            .iter()
            .map(|j| JointColumn {
                servo_id: j.servo_id,
                name: j.name.clone(),
                kind: j.kind,
            })
            .collect();
        Self {
            columns,
            interval_ms: interval_ms.max(1),
            frames: Vec::new(),
            first_ms: None,
            last_ms: 0.0,
        }
    }

    /// Record a frame if at least one interval passed since the last one.
    pub fn sample(&mut self, states: &[JointState], now_ms: f64) -> bool {
        if self.first_ms.is_some() && now_ms - self.last_ms < self.interval_ms as f64 {
            return false;
        }
        let frame = self
            .columns
            .iter()
            .map(|c| {
                states
                    .iter()
                    .find(|s| s.servo_id == c.servo_id)
                    .map(JointState::command_value)
                    .unwrap_or(0.0)
            })
            .collect();
        self.frames.push(frame);
        self.first_ms.get_or_insert(now_ms);
        self.last_ms = now_ms;
        true
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn finish(self, name: &str) -> Dataset {
        let duration_ms = self.first_ms.map_or(0.0, |first| self.last_ms - first);
        Dataset {
            name: name.to_string(),
            version: DATASET_VERSION.to_string(),
            created_at_ms: now_ms(),
            recording_interval_ms: self.interval_ms,
            duration_ms,
            joints: self.columns,
            frames: self.frames,
        }
    }
}

/// Persistence for recorded datasets.
pub trait DatasetStore {
    /// Store a dataset and return its id.
    fn save(&self, dataset: &Dataset) -> Result<String, DatasetError>;
    fn load(&self, id: &str) -> Result<Dataset, DatasetError>;
    fn list(&self) -> Result<Vec<DatasetInfo>, DatasetError>;
    fn delete(&self, id: &str) -> Result<(), DatasetError>;
}

/// One pretty-printed JSON file per dataset in a directory.
#[derive(Clone, Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// File for `id`. Ids name a file directly inside the store directory.
    fn path(&self, id: &str) -> Result<PathBuf, DatasetError> {
        let valid = !id.is_empty()
            && id != "."
            && !id.contains("..")
            && !id.contains(&['/', '\\', '\0'][..]);
        if !valid {
            return Err(DatasetError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn slug(name: &str) -> String {
        let slug: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let slug = slug.trim_matches('-').to_string();
        if slug.is_empty() {
            "dataset".to_string()
        } else {
            slug
        }
    }
}

impl DatasetStore for JsonDirStore {
    fn save(&self, dataset: &Dataset) -> Result<String, DatasetError> {
        let base = format!("{}-{}", Self::slug(&dataset.name), dataset.created_at_ms);
        let mut id = base.clone();
        let mut n = 1;
        while self.path(&id)?.exists() {
            n += 1;
            id = format!("{base}-{n}");
        }
        fs::write(self.path(&id)?, serde_json::to_vec_pretty(dataset)?)?;
        tracing::info!("Saved dataset {} ({} frames)", id, dataset.frame_count());
        Ok(id)
    }

    fn load(&self, id: &str) -> Result<Dataset, DatasetError> {
        let path = self.path(id)?;
        if !path.exists() {
            return Err(DatasetError::NotFound(id.to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn list(&self) -> Result<Vec<DatasetInfo>, DatasetError> {
        let mut infos = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match self.load(&id) {
                Ok(d) => infos.push(DatasetInfo {
                    id,
                    frame_count: d.frame_count(),
                    name: d.name,
                    created_at_ms: d.created_at_ms,
                    duration_ms: d.duration_ms,
                }),
                Err(e) => tracing::warn!("Skipping unreadable dataset {}: {}", path.display(), e),
            }
        }
        infos.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then(a.id.cmp(&b.id)));
        Ok(infos)
    }

    fn delete(&self, id: &str) -> Result<(), DatasetError> {
        match fs::remove_file(self.path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DatasetError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{IntegratorConfig, JointIntegrator};
    use crate::robots;

    fn record() -> Dataset {
        let robot = robots::preset("bambot-b0").unwrap();
        let registry = robot.registry().unwrap();
        let mut integrator =
            JointIntegrator::new(&registry, IntegratorConfig::default(), &robot.initial_degrees());
        let mut recorder = Recorder::new(&registry, RECORDING_INTERVAL_MS);

        integrator.set_speed(13, 40.0);
        let mut now = 0.0;
        for _ in 0..10 {
            recorder.sample(&integrator.snapshot(), now);
            now += 10.0;
            integrator.tick(10.0);
            integrator.set_absolute(1, 180.0 + now / 10.0);
        }
        recorder.finish("Wave hello")
    }

    #[test]
    fn test_recorder_samples_at_interval() {
        let dataset = record();
        assert_eq!(dataset.frame_count(), 5);
        assert_eq!(dataset.duration_ms, 80.0);
        assert_eq!(dataset.joints.len(), 15);
        assert_eq!(dataset.joints[12].servo_id, 13);

        // Revolute columns carry degrees, continuous columns carry speed.
        assert_eq!(dataset.frames[0][0], 180.0);
        assert_eq!(dataset.frames[1][0], 182.0);
        assert_eq!(dataset.frames[1][12], 40.0);
        assert_eq!(dataset.version, DATASET_VERSION);
    }

    #[test]
    fn test_json_dir_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).unwrap();
        let dataset = record();

        let id = store.save(&dataset).unwrap();
        assert!(id.starts_with("wave-hello-"));
        let second = store.save(&dataset).unwrap();
        assert_ne!(id, second);

        assert_eq!(store.load(&id).unwrap(), dataset);
        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].frame_count, 5);

        store.delete(&id).unwrap();
        assert!(matches!(store.load(&id), Err(DatasetError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(DatasetError::NotFound(_))));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_ids_cannot_leave_the_store() {
        let root = tempfile::tempdir().unwrap();
        let settings = root.path().join("settings.json");
        fs::write(&settings, b"{}").unwrap();
        let store = JsonDirStore::open(root.path().join("datasets")).unwrap();

        for id in ["../settings", "..", "a/b", "a\\b", ""] {
            assert!(matches!(store.delete(id), Err(DatasetError::InvalidId(_))), "{id:?}");
            assert!(matches!(store.load(id), Err(DatasetError::InvalidId(_))), "{id:?}");
        }
        assert!(settings.exists());
    }
}
