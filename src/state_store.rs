//! Atomic versioned JSON persistence for controller state (spec §4.5).
//!
//! Writes go to a temp file in the same directory as the target, then
//! `rename()` into place — on POSIX filesystems rename is atomic, so a
//! concurrent reader always sees either the old or the new snapshot, never
//! a half-written one (Testable Property #9).

use crate::error::StateStoreError;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

/// Implemented by every record type this module persists, so `load()` can
/// enforce the schema-version check itself rather than leaving it to each
/// caller.
pub trait Versioned {
    fn schema_version(&self) -> u32;
}

/// Loads and deserializes `T` from `path`. Any failure — missing file,
/// malformed JSON, or a schema version other than [`SCHEMA_VERSION`] —
/// returns `None` rather than raising, per spec §4.5's cold-start contract.
pub fn load<T: DeserializeOwned + Versioned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    let value: T = serde_json::from_slice(&bytes).ok()?;
    if value.schema_version() != SCHEMA_VERSION {
        return None;
    }
    Some(value)
}

/// Serializes `state` and writes it atomically to `path` via
/// write-tmp-then-rename within the same directory.
pub fn save<T: Serialize>(path: &Path, state: &T) -> Result<(), StateStoreError> {
    let json = serde_json::to_vec_pretty(state).map_err(StateStoreError::Serialize)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    fs::write(&tmp_path, &json).map_err(|source| StateStoreError::WriteTemp {
        path: tmp_path.display().to_string(),
        source,
    })?;

    fs::rename(&tmp_path, path).map_err(|source| StateStoreError::Rename {
        path: path.display().to_string(),
        source,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Dummy {
        schema_version: u32,
        value: u32,
    }

    impl Versioned for Dummy {
        fn schema_version(&self) -> u32 {
            self.schema_version
        }
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(load::<Dummy>(&path).is_none());
    }

    #[test]
    fn load_malformed_json_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(load::<Dummy>(&path).is_none());
    }

    #[test]
    fn load_missing_required_field_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"schema_version":1}"#).unwrap();
        assert!(load::<Dummy>(&path).is_none());
    }

    /// Spec §4.5: an unknown schema version cold-starts rather than
    /// handing back a record this build doesn't know how to interpret.
    #[test]
    fn load_unknown_schema_version_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"schema_version":2,"value":7}"#).unwrap();
        assert!(load::<Dummy>(&path).is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = Dummy {
            schema_version: SCHEMA_VERSION,
            value: 42,
        };
        save(&path, &state).unwrap();
        let loaded: Dummy = load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &Dummy { schema_version: 1, value: 1 }).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    /// Testable Property #9: a reader racing a writer's `save()` always
    /// observes a complete record, never a partial one.
    #[test]
    fn concurrent_reads_never_observe_partial_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &Dummy { schema_version: 1, value: 0 }).unwrap();

        let (tx, rx) = mpsc::channel();
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            for i in 1..200u32 {
                save(&writer_path, &Dummy { schema_version: 1, value: i }).unwrap();
            }
            tx.send(()).unwrap();
        });

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            while rx.try_recv().is_err() {
                if let Some(d) = load::<Dummy>(&reader_path) {
                    assert_eq!(d.schema_version, 1);
                }
                thread::sleep(Duration::from_micros(50));
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
