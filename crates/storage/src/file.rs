//! JsonlStore - appends records to one JSON-lines file per dataset

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use contracts::{StorageError, StorageSink, TelemetryEvent, WriteResult};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for JsonlStore
#[derive(Debug, Clone)]
pub struct JsonlStoreConfig {
    /// Base output directory
    pub base_path: PathBuf,
}

impl JsonlStoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Already persisted event ids
    seen: HashSet<String>,
    /// dataset_id -> open append handle
    files: HashMap<String, File>,
}

/// Store that writes each dataset to `{base_path}/{dataset_id}.jsonl`
///
/// Event ids found in existing files are loaded on open so replays after a
/// restart stay idempotent.
#[derive(Debug)]
pub struct JsonlStore {
    name: String,
    config: JsonlStoreConfig,
    state: Mutex<State>,
}

impl JsonlStore {
    /// Open (or create) the store directory
    pub fn open(name: impl Into<String>, config: JsonlStoreConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;
        let seen = load_seen_ids(&config.base_path)?;
        let name = name.into();
        info!(store = %name, path = %config.base_path.display(), existing = seen.len(), "JsonlStore opened");

        Ok(Self {
            name,
            config,
            state: Mutex::new(State {
                seen,
                files: HashMap::new(),
            }),
        })
    }

    /// Persisted record count
    pub fn count(&self) -> usize {
        self.state.lock().seen.len()
    }

    fn dataset_path(&self, dataset_id: &str) -> PathBuf {
        // dataset id 直接作为文件名，路径分隔符替换掉
        let file_name: String = dataset_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.config.base_path.join(format!("{file_name}.jsonl"))
    }

    /// Write one batch
    ///
    /// A dataset file that cannot be opened or appended fails only its own
    /// records; `Err` is reserved for the store directory itself.
    fn write_batch(&self, events: Vec<TelemetryEvent>) -> std::io::Result<Vec<WriteResult>> {
        if !fs::metadata(&self.config.base_path)?.is_dir() {
            return Err(std::io::Error::other(format!(
                "{} is not a directory",
                self.config.base_path.display()
            )));
        }

        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(events.len());

        for event in events {
            if let Err(reason) = event.validate() {
                results.push(WriteResult::failed(reason));
                continue;
            }
            if state.seen.contains(&event.event_id) {
                results.push(WriteResult::ok());
                continue;
            }

            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    results.push(WriteResult::failed(e.to_string()));
                    continue;
                }
            };

            match self.append(&mut state, &event.dataset_id, &line) {
                Ok(()) => {
                    state.seen.insert(event.event_id);
                    results.push(WriteResult::ok());
                }
                Err(e) => {
                    warn!(dataset = %event.dataset_id, error = %e, "record write failed");
                    results.push(WriteResult::failed(e.to_string()));
                }
            }
        }
        Ok(results)
    }

    fn append(&self, state: &mut State, dataset_id: &str, line: &str) -> std::io::Result<()> {
        if !state.files.contains_key(dataset_id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dataset_path(dataset_id))?;
            state.files.insert(dataset_id.to_string(), file);
        }
        let Some(file) = state.files.get_mut(dataset_id) else {
            return Err(std::io::Error::other("dataset file handle missing"));
        };
        writeln!(file, "{line}")?;
        file.flush()
    }
}

fn load_seen_ids(base_path: &Path) -> std::io::Result<HashSet<String>> {
    let mut seen = HashSet::new();
    for entry in fs::read_dir(base_path)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            // 截断的尾行忽略
            if let Ok(event) = serde_json::from_str::<TelemetryEvent>(&line) {
                seen.insert(event.event_id);
            }
        }
    }
    Ok(seen)
}

impl StorageSink for JsonlStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "jsonl_store_ingest",
        skip(self, events),
        fields(store = %self.name, events = events.len())
    )]
    async fn ingest(&self, events: Vec<TelemetryEvent>) -> Result<Vec<WriteResult>, StorageError> {
        let results = self.write_batch(events).map_err(|e| {
            error!(store = %self.name, error = %e, "write failed");
            StorageError::unavailable(&self.name, e.to_string())
        })?;
        debug!(results = results.len(), "batch written");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::event;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_writes_one_file_per_dataset() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(dir.path())).unwrap();

        let results = store
            .ingest(vec![
                event("a", "weather", 1.0),
                event("b", "traffic", 2.0),
                event("c", "weather", f64::INFINITY),
            ])
            .await
            .unwrap();
        assert_eq!(
            results.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, true, false]
        );

        let weather = fs::read_to_string(dir.path().join("weather.jsonl")).unwrap();
        assert_eq!(weather.lines().count(), 1);
        assert!(dir.path().join("traffic.jsonl").exists());
    }

    #[tokio::test]
    async fn test_replay_after_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        {
            let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(dir.path())).unwrap();
            store.ingest(vec![event("a", "weather", 1.0)]).await.unwrap();
        }

        let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.count(), 1);
        store.ingest(vec![event("a", "weather", 1.0)]).await.unwrap();

        let weather = fs::read_to_string(dir.path().join("weather.jsonl")).unwrap();
        assert_eq!(weather.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_dataset_file_fails_only_its_record() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(dir.path())).unwrap();

        // 文件名超出文件系统上限
        let results = store
            .ingest(vec![
                event("ok1", "weather", 1.0),
                event("bad", &"x".repeat(300), 2.0),
                event("ok2", "weather", 3.0),
            ])
            .await
            .unwrap();

        assert_eq!(
            results.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert!(results[1].error.is_some());
        assert_eq!(store.count(), 2);

        let weather = fs::read_to_string(dir.path().join("weather.jsonl")).unwrap();
        assert_eq!(weather.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_batch_error() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store");
        let store = JsonlStore::open("jsonl", JsonlStoreConfig::new(&base)).unwrap();
        fs::remove_dir_all(&base).unwrap();

        let result = store.ingest(vec![event("a", "weather", 1.0)]).await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }
}
