// Per-wound measurement history storage.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};
use woundtrack_common::{HealingHistory, HistoryError, Measurement, WoundId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("history store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("history file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("history store lock poisoned")]
    Poisoned,
}

/// Persistence for healing histories, keyed by wound
pub trait HistoryStore: Send + Sync {
    /// Append a measurement to the wound's history, creating the history if needed.
    /// The measurement must carry the same wound id.
    fn append(&self, wound_id: &WoundId, measurement: Measurement) -> Result<(), StoreError>;

    /// The wound's history; empty if nothing has been recorded
    fn read(&self, wound_id: &WoundId) -> Result<HealingHistory, StoreError>;

    fn wound_ids(&self) -> Result<Vec<WoundId>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    histories: RwLock<HashMap<WoundId, HealingHistory>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, wound_id: &WoundId, measurement: Measurement) -> Result<(), StoreError> {
        if measurement.wound_id != *wound_id {
            return Err(HistoryError::ForeignMeasurement {
                expected: wound_id.clone(),
                found: measurement.wound_id,
            }
            .into());
        }
        let mut histories = self.histories.write().map_err(|_| StoreError::Poisoned)?;
        histories
            .entry(wound_id.clone())
            .or_insert_with(|| HealingHistory::new(wound_id.clone()))
            .append(measurement)?;
        Ok(())
    }

    fn read(&self, wound_id: &WoundId) -> Result<HealingHistory, StoreError> {
        let histories = self.histories.read().map_err(|_| StoreError::Poisoned)?;
        Ok(histories
            .get(wound_id)
            .cloned()
            .unwrap_or_else(|| HealingHistory::new(wound_id.clone())))
    }

    fn wound_ids(&self) -> Result<Vec<WoundId>, StoreError> {
        let histories = self.histories.read().map_err(|_| StoreError::Poisoned)?;
        let mut ids: Vec<WoundId> = histories.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per wound under a root directory.
///
/// Writes go to a sibling temp file that is then renamed over the original,
/// so a crash mid-write never leaves a truncated history behind. The lock
/// serialises writers within this process only.
#[derive(Debug)]
pub struct JsonHistoryStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl JsonHistoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        info!("Using history store at {}", root.display());
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, wound_id: &WoundId) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(wound_id)))
    }

    fn load(&self, wound_id: &WoundId) -> Result<HealingHistory, StoreError> {
        let path = self.path_for(wound_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(HealingHistory::new(wound_id.clone()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&text).map_err(|source| StoreError::Corrupt { path, source })
    }

    fn save(&self, history: &HealingHistory) -> Result<(), StoreError> {
        let path = self.path_for(history.wound_id());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(history).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(
            "Saved {} measurement(s) for wound {} to {}",
            history.len(),
            history.wound_id(),
            path.display()
        );
        Ok(())
    }
}

impl HistoryStore for JsonHistoryStore {
    fn append(&self, wound_id: &WoundId, measurement: Measurement) -> Result<(), StoreError> {
        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut history = self.load(wound_id)?;
        history.append(measurement)?;
        self.save(&history)
    }

    fn read(&self, wound_id: &WoundId) -> Result<HealingHistory, StoreError> {
        let _guard = self.lock.read().map_err(|_| StoreError::Poisoned)?;
        let history = self.load(wound_id)?;
        if history.wound_id() != wound_id {
            return Err(StoreError::History(HistoryError::ForeignMeasurement {
                expected: wound_id.clone(),
                found: history.wound_id().clone(),
            }));
        }
        Ok(history)
    }

    fn wound_ids(&self) -> Result<Vec<WoundId>, StoreError> {
        let _guard = self.lock.read().map_err(|_| StoreError::Poisoned)?;
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    path: self.root.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let history: HealingHistory = serde_json::from_str(&text)
                .map_err(|source| StoreError::Corrupt { path, source })?;
            ids.push(history.wound_id().clone());
        }
        ids.sort();
        Ok(ids)
    }
}

/// File-system safe name for a wound id, distinct ids never share a name.
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`.
fn file_stem(wound_id: &WoundId) -> String {
    let mut stem = String::with_capacity(wound_id.as_str().len());
    for byte in wound_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "%{:02X}", byte);
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn measurement(wound: &str, day: i64, area: f64) -> Measurement {
        Measurement {
            wound_id: WoundId::from(wound),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::days(day),
            area_cm2: area,
            tissue_fractions: BTreeMap::new(),
            redness_score: 0.1,
            pus_score: 0.0,
            patient_is_diabetic: true,
        }
    }

    fn exercise(store: &dyn HistoryStore) {
        assert!(store.read(&WoundId::from("a")).unwrap().is_empty());

        store.append(&WoundId::from("a"), measurement("a", 0, 4.0)).unwrap();
        store.append(&WoundId::from("a"), measurement("a", 7, 3.5)).unwrap();
        store.append(&WoundId::from("b"), measurement("b", 0, 1.0)).unwrap();

        let a = store.read(&WoundId::from("a")).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.latest().unwrap().area_cm2, 3.5);

        let err = store.append(&WoundId::from("a"), measurement("a", 3, 3.8)).unwrap_err();
        assert!(matches!(err, StoreError::History(HistoryError::OutOfOrder { .. })));
        assert_eq!(store.read(&WoundId::from("a")).unwrap().len(), 2);

        let err = store.append(&WoundId::from("a"), measurement("c", 30, 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::History(HistoryError::ForeignMeasurement { .. })));
        assert!(!store.wound_ids().unwrap().contains(&WoundId::from("c")));

        assert_eq!(
            store.wound_ids().unwrap(),
            vec![WoundId::from("a"), WoundId::from("b")]
        );
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryHistoryStore::new());
    }

    #[test]
    fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&JsonHistoryStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonHistoryStore::open(dir.path()).unwrap();
            store.append(&WoundId::from("ulcer/left heel"), measurement("ulcer/left heel", 0, 2.0)).unwrap();
        }
        let store = JsonHistoryStore::open(dir.path()).unwrap();
        let history = store.read(&WoundId::from("ulcer/left heel")).unwrap();
        assert_eq!(history.len(), 1);
        assert!(dir.path().join("ulcer%2Fleft%20heel.json").exists());
        assert!(!dir.path().join("ulcer%2Fleft%20heel.json.tmp").exists());
    }

    #[test]
    fn test_similar_ids_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::open(dir.path()).unwrap();
        for (id, area) in [("a/b", 1.0), ("a_b", 2.0), ("a%2Fb", 3.0)] {
            store.append(&WoundId::from(id), measurement(id, 0, area)).unwrap();
        }

        for (id, area) in [("a/b", 1.0), ("a_b", 2.0), ("a%2Fb", 3.0)] {
            let history = store.read(&WoundId::from(id)).unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history.latest().unwrap().area_cm2, area);
        }
        assert_eq!(
            store.wound_ids().unwrap(),
            vec![WoundId::from("a%2Fb"), WoundId::from("a/b"), WoundId::from("a_b")]
        );
        assert_eq!(file_stem(&WoundId::from("heel-2_L")), "heel-2_L");
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("w1.json"), "{ not json").unwrap();
        let store = JsonHistoryStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.read(&WoundId::from("w1")),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
