//! Persisted daemon state.
//!
//! Records the last intentional user choice so a restart resumes blocking
//! (or not) without asking. Written on toggle and on graceful shutdown.

use std::io::Write;
use std::path::Path;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    pub is_blocking: bool,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl DaemonState {
    pub fn new(is_blocking: bool) -> Self {
        Self {
            is_blocking,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load the persisted state, or `None` on a missing or unreadable file.
    /// A blocker with no recorded choice defaults to blocking, which the
    /// caller decides.
    pub fn load(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, "could not read state file");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "state file is corrupt, ignoring it");
                None
            }
        }
    }

    pub fn store(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).expect("state always serializes");
        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(content.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        DaemonState::new(true).store(&path).unwrap();
        let loaded = DaemonState::load(&path).unwrap();

        assert!(loaded.is_blocking);
        assert_eq!(loaded.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let json = serde_json::to_string(&DaemonState::new(false)).unwrap();
        assert!(json.contains("\"isBlocking\":false"));
        assert!(json.contains("\"timestamp\""));
        assert!(json.contains("\"version\""));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DaemonState::load(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn corrupt_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{{{{").unwrap();
        assert!(DaemonState::load(&path).is_none());
    }
}
