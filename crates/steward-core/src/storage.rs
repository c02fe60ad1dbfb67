//! JSON persistence helpers shared by the ledgers.
//!
//! Writes go through a same-directory temp file followed by an atomic rename
//! so a crash mid-write never leaves a half-written ledger behind.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Load a JSON file if it exists. A missing file is `Ok(None)`, not an error.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Write a value as pretty JSON via temp-file-then-rename.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let contents = serde_json::to_string_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_and_handles_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let missing: Option<HashMap<String, u32>> = load_json(&path).unwrap();
        assert!(missing.is_none());

        let mut map = HashMap::new();
        map.insert("a".to_string(), 1u32);
        save_json_atomic(&path, &map).unwrap();

        let loaded: Option<HashMap<String, u32>> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap().get("a"), Some(&1));
    }

    #[test]
    fn overwrite_is_atomic_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        save_json_atomic(&path, &vec![4]).unwrap();
        let loaded: Option<Vec<u32>> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap(), vec![4]);
    }
}
