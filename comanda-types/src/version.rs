//! Version tags — the conflict-resolution metadata of one record.

use serde::{Deserialize, Serialize};

/// The resolution metadata carried by every change and stored per record.
///
/// Tags are totally ordered, most significant field first:
///
/// 1. `priority` — domain-assigned rank; higher wins outright.
/// 2. `version` — per-record monotonic version from the originator.
/// 3. `counter` — the originator's local monotonic counter; only ever a
///    tie-break seed, never cross-device wall time.
/// 4. `checksum` — lexicographic hex comparison, guaranteeing a total
///    order even between devices that tie on everything else.
///
/// The derived ordering compares fields in declaration order, which is
/// exactly this precedence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTag {
    /// Domain-assigned priority rank.
    pub priority: i64,
    /// Per-record monotonic version.
    pub version: u64,
    /// Originator-local monotonic counter.
    pub counter: u64,
    /// Hex-encoded payload checksum.
    pub checksum: String,
}

impl VersionTag {
    /// Creates a new tag.
    #[must_use]
    pub fn new(priority: i64, version: u64, counter: u64, checksum: impl Into<String>) -> Self {
        Self {
            priority,
            version,
            counter,
            checksum: checksum.into(),
        }
    }
}
