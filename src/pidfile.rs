//! Single-instance enforcement via a PID file.
//!
//! The file records the owning process id and start time. On startup a
//! live record refuses the new instance; a record whose process is gone is
//! stale and silently replaced.

use std::io::Write;
use std::path::PathBuf;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another instance is already running (pid {pid})")]
    AnotherInstance { pid: u32 },

    #[error("pid file I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidRecord {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub platform: String,
}

impl PidRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            start_time: Utc::now(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Holds the PID file for the lifetime of the daemon.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Enforce single-instance and write our own record.
    ///
    /// `force` skips the liveness refusal but still overwrites the file.
    pub fn acquire(path: PathBuf, force: bool) -> Result<Self, PidFileError> {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PidRecord>(&content) {
                Ok(record) if record.pid != std::process::id() && is_process_alive(record.pid) => {
                    if force {
                        tracing::warn!(pid = record.pid, "ignoring live pid file (--force)");
                    } else {
                        return Err(PidFileError::AnotherInstance { pid: record.pid });
                    }
                }
                Ok(record) => {
                    tracing::info!(pid = record.pid, "removing stale pid file");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pid file is corrupt, replacing it");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&PidRecord::current())
            .expect("pid record always serializes");
        AtomicFile::new(&path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(content.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => e,
            })?;

        Ok(Self { path })
    }

    /// Remove the PID file. Called last in the shutdown sequence.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "could not remove pid file");
            }
        }
    }
}

/// Whether a process with the given pid exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 checks existence without delivering anything. EPERM means
    // the process exists but belongs to someone else.
    #[allow(clippy::cast_possible_wrap)]
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    match std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .output()
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\"")),
        // If tasklist itself fails, assume the process is alive: refusing
        // to start beats running two instances.
        Err(_) => true,
    }
}
