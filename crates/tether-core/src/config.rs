//! State-root resolution and the atomic-write-json helper shared by
//! the Registry, thread-mapping, and Settings documents. The state
//! root is a value threaded through at daemon construction, not a
//! process-wide constant, so it can be overridden for tests.

use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};
use tether_types::Settings;

/// Resolves the directory all daemon state lives under. Honors an
/// explicit `TETHER_HOME` override, falling back to the platform data
/// directory.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TETHER_HOME") {
        return Ok(PathBuf::from(path));
    }
    let data_dir = dirs::data_dir()
        .ok_or_else(|| RelayError::Config("could not determine data directory".into()))?;
    Ok(data_dir.join("tether"))
}

pub fn registry_path(root: &Path) -> PathBuf {
    root.join("registry.json")
}

pub fn thread_mapping_path(root: &Path) -> PathBuf {
    root.join("thread_mapping.json")
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join("settings.json")
}

pub fn pid_path(root: &Path) -> PathBuf {
    root.join("daemon.pid")
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join("daemon.log")
}

pub fn socket_path(root: &Path) -> PathBuf {
    root.join("daemon.sock")
}

/// Atomic replace: write to a sibling temp file, then rename over the
/// target. Used for every on-disk document the daemon persists.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RelayError::Disk(format!("{path:?} has no parent directory")))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| RelayError::Disk(format!("failed to create directory {parent:?}: {e}")))?;

    let content = serde_json::to_string_pretty(value)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, &content)
        .map_err(|e| RelayError::Disk(format!("failed to write temp file {tmp_path:?}: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&tmp_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| RelayError::Disk(format!("failed to rename {tmp_path:?} to {path:?}: {e}")))?;

    Ok(())
}

/// Reads and deserializes a JSON document, or `None` if it doesn't exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Disk(format!("failed to read {path:?}: {e}")))?;
    let value = serde_json::from_str(&content)?;
    Ok(Some(value))
}

/// Loads settings, creating a default document on disk if none exists.
pub fn load_settings(root: &Path) -> Result<Settings> {
    let path = settings_path(root);
    match read_json::<Settings>(&path)? {
        Some(settings) => Ok(settings),
        None => {
            let settings = Settings::default();
            atomic_write_json(&path, &settings)?;
            Ok(settings)
        }
    }
}

pub fn save_settings(root: &Path, settings: &Settings) -> Result<()> {
    atomic_write_json(&settings_path(root), settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_settings_creates_default_when_missing() {
        let dir = tempdir().unwrap();
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.version, 1);
        assert!(settings_path(dir.path()).exists());
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Settings {
            auto_cleanup_orphans: true,
            ..Settings::default()
        };
        atomic_write_json(&path, &doc).unwrap();
        let back: Settings = read_json(&path).unwrap().unwrap();
        assert!(back.auto_cleanup_orphans);
    }

    #[test]
    fn no_leftover_temp_file_after_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &Settings::default()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
