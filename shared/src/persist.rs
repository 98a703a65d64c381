//! Atomic file persistence: every subsystem that journals state to disk
//! (rate limiters, swap state, checkpoints, sponsor budgets) writes to a
//! sibling temp file and renames it over the target, so a crash mid-write
//! never leaves a torn file behind.

use crate::{BlockchainError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Serializes `value` to pretty JSON and atomically replaces the file
/// at `path`: the bytes are written to `path.tmp`, fsync'd, then
/// renamed over `path`. The rename is atomic on POSIX filesystems, so
/// readers never observe a partially written file.
///
/// # Errors
///
/// Returns [`BlockchainError::PersistenceError`] if serialization or any
/// filesystem operation fails.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
    write_bytes_atomic(path, &bytes)
}

/// Atomically replaces the file at `path` with `bytes`.
///
/// # Errors
///
/// Returns [`BlockchainError::PersistenceError`] if any filesystem
/// operation fails.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
        }
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
        file.sync_all()
            .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
    Ok(())
}

/// Reads and deserializes the JSON file at `path`. Returns `None` if the
/// file does not exist yet, which callers treat as "start from an empty
/// default state" rather than an error.
///
/// # Errors
///
/// Returns [`BlockchainError::PersistenceError`] if the file exists but
/// cannot be read or does not parse as the expected type.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| BlockchainError::PersistenceError(e.to_string()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BlockchainError::PersistenceError(e.to_string())),
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("xai-persist-test-{}", std::process::id()));
        let path = dir.join("sample.json");

        let value = Sample {
            name: "sponsor-a".to_string(),
            count: 7,
        };
        write_json_atomic(&path, &value).unwrap();

        let loaded: Option<Sample> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(value));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn read_json_returns_none_for_missing_file() {
        let path = std::env::temp_dir().join("xai-persist-test-missing-file.json");
        let loaded: Option<Sample> = read_json(&path).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn write_json_atomic_leaves_no_tmp_file_behind() {
        let dir = std::env::temp_dir().join(format!("xai-persist-test-tmp-{}", std::process::id()));
        let path = dir.join("state.json");

        write_json_atomic(&path, &Sample { name: "x".into(), count: 1 }).unwrap();

        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
