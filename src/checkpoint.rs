use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::Timestamp;
use crate::error::SyncError;

/// Name of the marker file kept inside the data directory.
pub const MARKER_FILE: &str = ".update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum CheckpointState {
    Absent,
    Unreadable(String),
    Corrupt(String),
    Valid(Timestamp),
}

impl CheckpointState {
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            CheckpointState::Valid(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Reads and replaces the `.update` marker of one data directory.
///
/// There is no locking: two runs against the same directory race on the marker.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    data_dir: Utf8PathBuf,
}

impl CheckpointStore {
    pub fn new(data_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn marker_path(&self) -> Utf8PathBuf {
        self.data_dir.join(MARKER_FILE)
    }

    /// Creates the data directory if needed. Returns `true` when it had to be created.
    pub fn ensure_data_dir(&self) -> Result<bool, SyncError> {
        if self.data_dir.as_std_path().is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(self.data_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("create {}: {err}", self.data_dir)))?;
        Ok(true)
    }

    pub fn inspect(&self) -> CheckpointState {
        let path = self.marker_path();
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => match content.parse::<Timestamp>() {
                Ok(ts) => CheckpointState::Valid(ts),
                Err(_) => CheckpointState::Corrupt(content.trim().to_string()),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => CheckpointState::Absent,
            Err(err) => CheckpointState::Unreadable(err.to_string()),
        }
    }

    pub fn load(&self) -> Option<Timestamp> {
        self.inspect().timestamp()
    }

    /// Replaces the marker with `timestamp`. The new content is written to a
    /// temporary file next to the marker and renamed over it.
    pub fn save(&self, timestamp: Timestamp) -> Result<(), SyncError> {
        let path = self.marker_path();
        let mut temp = Builder::new()
            .prefix(".update")
            .suffix(".tmp")
            .tempfile_in(self.data_dir.as_std_path())
            .map_err(|err| SyncError::CheckpointWrite(format!("{path}: {err}")))?;
        temp.write_all(timestamp.to_string().as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| SyncError::CheckpointWrite(format!("{path}: {err}")))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::CheckpointWrite(format!("{path}: {}", err.error)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(temp: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap())
    }

    #[test]
    fn marker_lives_in_data_dir() {
        let store = CheckpointStore::new("/data/s6");
        assert_eq!(store.marker_path(), Utf8PathBuf::from("/data/s6/.update"));
    }

    #[test]
    fn missing_marker_is_absent() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);
        assert_eq!(store.inspect(), CheckpointState::Absent);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn marker_with_trailing_newline_is_valid() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);
        fs::write(store.marker_path().as_std_path(), "2021-03-10T00:00:00Z\n").unwrap();
        assert_eq!(store.load(), Some("2021-03-10T00:00:00Z".parse().unwrap()));
    }

    #[test]
    fn garbage_marker_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);
        fs::write(store.marker_path().as_std_path(), "not a date").unwrap();
        assert_eq!(
            store.inspect(),
            CheckpointState::Corrupt("not a date".to_string())
        );
        assert_eq!(store.load(), None);
    }

    #[test]
    fn save_overwrites_exact_content() {
        let temp = tempfile::tempdir().unwrap();
        let store = store_in(&temp);
        store.save("2021-03-10T00:00:00Z".parse().unwrap()).unwrap();
        store.save("2021-03-11T12:00:00Z".parse().unwrap()).unwrap();
        let content = fs::read_to_string(store.marker_path().as_std_path()).unwrap();
        assert_eq!(content, "2021-03-11T12:00:00Z");

        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn save_into_missing_dir_fails() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            Utf8PathBuf::from_path_buf(temp.path().join("missing")).unwrap(),
        );
        let err = store.save("2021-03-10T00:00:00Z".parse().unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::CheckpointWrite(_)));
    }

    #[test]
    fn ensure_data_dir_reports_creation() {
        let temp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            Utf8PathBuf::from_path_buf(temp.path().join("nested").join("data")).unwrap(),
        );
        assert!(store.ensure_data_dir().unwrap());
        assert!(!store.ensure_data_dir().unwrap());
    }
}
