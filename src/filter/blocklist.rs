//! Blocklist storage and lookup.
//!
//! The blocklist is an immutable snapshot of lowercased domain names loaded
//! from a JSON file. Lookups match the exact name and every proper suffix,
//! so listing `example.com` blocks `a.b.example.com`. Snapshots are replaced
//! atomically; in-flight queries keep the snapshot they captured.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Refuse to parse blocklist files larger than this.
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Fallback entries used when the configured list cannot be loaded, so the
/// proxy never starts with zero protection.
const EMERGENCY_SEEDS: &[&str] = &[
    "pornhub.com",
    "xvideos.com",
    "xnxx.com",
    "xhamster.com",
    "redtube.com",
    "youporn.com",
];

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("failed to read blocklist file: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocklist file is {size} bytes, limit is {MAX_FILE_SIZE}")]
    TooLarge { size: u64 },

    #[error("blocklist file is not a JSON array of strings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("blocklist contains no valid entries")]
    Empty,
}

/// An immutable set of blocked domains.
pub struct Blocklist {
    domains: FxHashSet<String>,
    generation: u64,
}

impl Blocklist {
    /// Load a blocklist from a JSON file containing an array of strings.
    ///
    /// Entries are trimmed, lowercased, stripped of a trailing dot, and
    /// validated; invalid entries are counted and skipped. A file that is
    /// too large, unparsable, or yields no valid entries is an error — the
    /// caller should fall back to [`Blocklist::emergency`].
    pub fn load(path: &Path) -> Result<Self, BlocklistError> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_FILE_SIZE {
            return Err(BlocklistError::TooLarge { size });
        }

        let content = std::fs::read_to_string(path)?;
        let entries: Vec<String> = serde_json::from_str(&content)?;

        let mut domains = FxHashSet::default();
        let mut rejected = 0usize;
        for entry in &entries {
            match normalize(entry) {
                Some(domain) => {
                    domains.insert(domain);
                }
                None => rejected += 1,
            }
        }

        if domains.is_empty() {
            return Err(BlocklistError::Empty);
        }

        tracing::info!(
            path = %path.display(),
            accepted = domains.len(),
            rejected,
            "loaded blocklist"
        );

        Ok(Self {
            domains,
            generation: 0,
        })
    }

    /// The hardcoded emergency list.
    pub fn emergency() -> Self {
        Self {
            domains: EMERGENCY_SEEDS.iter().map(|s| s.to_string()).collect(),
            generation: 0,
        }
    }

    /// Check whether a domain should be blocked.
    ///
    /// Matches the exact name, then each suffix obtained by dropping leading
    /// labels. Assumes `domain` is already lowercase without a trailing dot,
    /// which is what [`crate::dns::DnsQuery::parse`] produces.
    #[inline]
    pub fn is_blocked(&self, domain: &str) -> bool {
        let mut current = domain;
        loop {
            if self.domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// Number of domains in the list.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Snapshot generation, bumped on every swap.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared handle to the active blocklist snapshot.
///
/// Readers grab an `Arc` to the current snapshot; `swap` replaces it
/// atomically without disturbing queries already in flight.
pub struct BlocklistHandle {
    inner: ArcSwap<Blocklist>,
}

impl BlocklistHandle {
    pub fn new(list: Blocklist) -> Self {
        Self {
            inner: ArcSwap::from_pointee(list),
        }
    }

    pub fn current(&self) -> Arc<Blocklist> {
        self.inner.load_full()
    }

    /// Atomically replace the active snapshot.
    pub fn swap(&self, mut list: Blocklist) {
        list.generation = self.inner.load().generation + 1;
        self.inner.store(Arc::new(list));
    }
}

/// Normalize and validate a raw blocklist entry.
///
/// Returns the canonical stored form, or `None` if the entry is not a valid
/// domain name.
fn normalize(entry: &str) -> Option<String> {
    let trimmed = entry.trim();
    // A single trailing dot is the FQDN form; more than one is malformed
    // and falls through to validation as an empty label.
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    let lowered = trimmed.to_ascii_lowercase();
    if is_valid_domain(&lowered) {
        Some(lowered)
    } else {
        None
    }
}

/// Validate a lowercased domain name: 1-253 octets, at least two labels,
/// each label 1-63 octets of `[a-z0-9]([a-z0-9-]*[a-z0-9])?`.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
