//! Well-known file locations.
//!
//! The daemon runs privileged, so state lives in the system data directory
//! rather than a per-user one.

use std::path::PathBuf;

#[cfg(target_os = "windows")]
pub fn data_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\waylay")
}

#[cfg(target_os = "macos")]
pub fn data_dir() -> PathBuf {
    PathBuf::from("/Library/Application Support/waylay")
}

#[cfg(all(unix, not(target_os = "macos")))]
pub fn data_dir() -> PathBuf {
    PathBuf::from("/var/lib/waylay")
}

pub fn pid_path() -> PathBuf {
    data_dir().join("waylay.pid")
}

pub fn state_path() -> PathBuf {
    data_dir().join("state.json")
}

pub fn backup_path() -> PathBuf {
    data_dir().join("dns-backup.json")
}

pub fn default_blocklist_path() -> PathBuf {
    data_dir().join("blocklist.json")
}
