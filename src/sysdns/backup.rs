//! Persisted resolver backups.
//!
//! Before the first reconfiguration the pre-existing resolver state is
//! written to disk so it can be restored after a clean exit, a crash, or a
//! user request. A backup whose stored value points at loopback is poisoned
//! (it was taken after an earlier failed cleanup) and must never be
//! restored as-is.

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::SysDnsError;

/// The original resolver value captured in a backup.
///
/// Wire form is `string[]` for explicit servers, the literal `"dhcp"` for
/// automatic configuration, or any other string for a verbatim copy of a
/// resolver configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginalDns {
    Servers(Vec<IpAddr>),
    Dhcp,
    File(String),
}

impl OriginalDns {
    pub fn is_poisoned(&self) -> bool {
        match self {
            Self::Servers(servers) => servers.iter().any(|ip| is_loopback(*ip)),
            Self::Dhcp => false,
            Self::File(contents) => contents.contains("127.0.0.") || contents.contains("localhost"),
        }
    }
}

pub(crate) fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 127,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

impl Serialize for OriginalDns {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Servers(servers) => servers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .serialize(serializer),
            Self::Dhcp => "dhcp".serialize(serializer),
            Self::File(contents) => contents.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OriginalDns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(Vec<String>),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::List(entries) => {
                let servers = entries
                    .iter()
                    .map(|s| s.parse::<IpAddr>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| D::Error::custom(format!("bad resolver address: {e}")))?;
                Ok(Self::Servers(servers))
            }
            Raw::Text(text) if text == "dhcp" => Ok(Self::Dhcp),
            Raw::Text(text) => Ok(Self::File(text)),
        }
    }
}

/// On-disk record of the pre-modification resolver state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsBackup {
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub interface: String,
    #[serde(rename = "originalDNS")]
    pub original_dns: OriginalDns,
}

impl DnsBackup {
    pub fn new(platform: &str, interface: &str, original_dns: OriginalDns) -> Self {
        Self {
            timestamp: Utc::now(),
            platform: platform.to_string(),
            interface: interface.to_string(),
            original_dns,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.original_dns.is_poisoned()
    }

    /// Load the backup if one exists.
    pub fn load(path: &Path) -> Result<Option<Self>, SysDnsError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SysDnsError::BackupIo(e)),
        };
        let backup = serde_json::from_str(&content).map_err(SysDnsError::BackupFormat)?;
        Ok(Some(backup))
    }

    /// Persist the backup, overwriting any previous one.
    pub fn store(&self, path: &Path) -> Result<(), SysDnsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SysDnsError::BackupIo)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(SysDnsError::BackupFormat)?;
        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(content.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => {
                    SysDnsError::BackupIo(e)
                }
            })?;
        Ok(())
    }
}
