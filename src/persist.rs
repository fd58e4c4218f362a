//! Atomic JSON persistence.
//!
//! Every persisted file is written the same way: serialize, write to
//! `<path>.tmp`, rename over the destination. The previous contents are
//! rotated into `<path>.backup.<epochMillis>` files, pruned oldest-first
//! beyond the configured count.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write `value` atomically, rotating the old file into a backup first.
pub fn save_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    max_backups: usize,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if max_backups > 0 && path.exists() {
        let stamp = chrono::Utc::now().timestamp_millis();
        let backup = backup_path(path, stamp);
        if let Err(e) = std::fs::copy(path, &backup) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write rolling backup");
        }
        prune_backups(path, max_backups);
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a persisted file. `Ok(None)` when the file does not exist yet.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn backup_path(path: &Path, stamp: i64) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}.backup.{stamp}"))
}

/// Remove the oldest backups beyond `max_backups`. Backup recency orders by
/// the embedded epoch-millis suffix.
fn prune_backups(path: &Path, max_backups: usize) {
    let Some(parent) = path.parent() else {
        return;
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{file_name}.backup.");

    let Ok(entries) = std::fs::read_dir(parent) else {
        return;
    };
    let mut backups: Vec<(i64, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stamp: i64 = name.strip_prefix(&prefix)?.parse().ok()?;
            Some((stamp, entry.path()))
        })
        .collect();
    if backups.len() <= max_backups {
        return;
    }
    backups.sort_by_key(|(stamp, _)| *stamp);
    let excess = backups.len() - max_backups;
    for (_, stale) in backups.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&stale) {
            tracing::warn!(path = %stale.display(), error = %e, "Failed to prune backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let value = Sample {
            name: "fleet".into(),
            count: 3,
        };
        save_json_atomic(&path, &value, 0).unwrap();
        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Sample> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded: io::Result<Option<Sample>> = load_json(&path);
        assert!(loaded.is_err());
    }

    #[test]
    fn rewrites_keep_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        for i in 0..5u32 {
            let value = Sample {
                name: "fleet".into(),
                count: i,
            };
            save_json_atomic(&path, &value, 2).unwrap();
            // Distinct millisecond stamps per backup.
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("state.json.backup.")
            })
            .count();
        assert!(backups <= 2, "expected ≤2 backups, found {backups}");
        // The live file holds the latest value.
        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert_eq!(loaded.unwrap().count, 4);
    }
}
