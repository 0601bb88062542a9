//! Atomic persistence primitives.
//!
//! Every durable write in MAO goes through this module: materialise to a
//! sibling temp file (`<name>.<rand8>.tmp`) in the same directory, then
//! rename over the destination. On POSIX the rename is atomic, so readers
//! never observe partial content.
//!
//! Exactly one orchestrator process runs per project, so writers to the
//! same entity serialise through process-wide named mutexes rather than
//! file locks.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MaoError, MaoResult};

/// Build the temp-file sibling used for an atomic write.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entity".to_string());
    let rand = crate::short_id();
    path.with_file_name(format!("{name}.{rand}.tmp"))
}

fn map_io(err: std::io::Error, path: &Path) -> MaoError {
    match err.kind() {
        std::io::ErrorKind::NotFound => MaoError::file_not_found(path),
        std::io::ErrorKind::PermissionDenied => MaoError::Permission {
            path: path.to_path_buf(),
        },
        _ => MaoError::Io(err),
    }
}

/// Write raw bytes atomically: temp sibling + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> MaoResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| map_io(e, parent))?;
    }
    let tmp = temp_sibling(path);
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(map_io(e, path));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(map_io(e, path));
    }
    Ok(())
}

/// Read a JSON entity. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> MaoResult<Option<T>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(map_io(e, path)),
    }
}

/// Write a JSON entity atomically, pretty-printed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> MaoResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    write_atomic(path, text.as_bytes())
}

/// Read a YAML entity. `Ok(None)` when the file does not exist.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> MaoResult<Option<T>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_yaml::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(map_io(e, path)),
    }
}

/// Write a YAML entity atomically.
pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> MaoResult<()> {
    let text = serde_yaml::to_string(value)?;
    write_atomic(path, text.as_bytes())
}

/// Append `entry` to the JSON-array index at `index_path`.
///
/// The caller has already written the per-entity file at `entity_path`; if
/// the index write fails the entity file is deleted (rollback) so the index
/// and the per-entity files never disagree. On success both are committed.
pub fn append_to_index<T: Serialize>(
    index_path: &Path,
    entity_path: &Path,
    entry: &T,
) -> MaoResult<()> {
    let mut entries: Vec<serde_json::Value> = read_json(index_path)?.unwrap_or_default();
    entries.push(serde_json::to_value(entry)?);
    if let Err(e) = write_json(index_path, &entries) {
        let _ = fs::remove_file(entity_path);
        return Err(e);
    }
    Ok(())
}

/// A process-wide named mutex.
///
/// Writers to the same logical entity (`"feedback"`, `"approval"`, ...)
/// lock the same mutex; distinct names never contend.
pub fn named_lock(name: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entity {
        id: String,
        value: u32,
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.json");

        let entity = Entity {
            id: "abc".into(),
            value: 42,
        };
        write_json(&path, &entity).unwrap();

        let loaded: Entity = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, entity);
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Option<Entity> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.yaml");

        let entity = Entity {
            id: "yaml".into(),
            value: 7,
        };
        write_yaml(&path, &entity).unwrap();
        let loaded: Entity = read_yaml(&path).unwrap().unwrap();
        assert_eq!(loaded, entity);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        write_json(&path, &Entity { id: "x".into(), value: 1 }).unwrap();
        write_json(&path, &Entity { id: "x".into(), value: 2 }).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let loaded: Entity = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.value, 2);
    }

    #[test]
    fn test_append_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.json");
        let entity_path = dir.path().join("e1.json");

        let entity = Entity { id: "e1".into(), value: 1 };
        write_json(&entity_path, &entity).unwrap();
        append_to_index(&index, &entity_path, &entity).unwrap();

        let entries: Vec<Entity> = read_json(&index).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "e1");
        assert!(entity_path.exists());
    }

    #[test]
    fn test_append_to_index_rolls_back_entity_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        // Point the index inside a path that is a file, so creating the
        // parent directory fails and the index write errors out.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let index = blocker.join("index.json");

        let entity_path = dir.path().join("e1.json");
        let entity = Entity { id: "e1".into(), value: 1 };
        write_json(&entity_path, &entity).unwrap();

        let result = append_to_index(&index, &entity_path, &entity);
        assert!(result.is_err());
        assert!(!entity_path.exists(), "entity must be rolled back");
    }

    #[test]
    fn test_named_lock_is_shared_by_name() {
        let a = named_lock("unit-test-entity");
        let b = named_lock("unit-test-entity");
        let c = named_lock("unit-test-other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
