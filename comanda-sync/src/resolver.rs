//! Conflict resolution.
//!
//! Each record is a last-writer-wins register over a fixed total order of
//! version tags: priority, then version, then the originator's local
//! counter, then the lexicographic checksum. Applying any set of updates
//! in any order lands every device on the same final value; the merge is
//! commutative, associative and idempotent, exactly like an LWW register
//! keyed on the tag instead of a timestamp.
//!
//! Wall clocks never participate: venue tablets drift too much to trust.

use comanda_types::VersionTag;
use std::cmp::Ordering;

/// The outcome of resolving an incoming update against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The incoming update wins; apply it and advance the record tag.
    Apply,
    /// The incoming update loses or repeats known state; record it as
    /// processed but change nothing.
    Discard,
}

/// Compares two tags under the resolution order.
///
/// `VersionTag` derives its ordering from field order (priority, version,
/// counter, checksum), which is the resolution order; this function exists
/// to make call sites explicit about what is being decided.
pub fn compare(local: &VersionTag, incoming: &VersionTag) -> Ordering {
    local.cmp(incoming)
}

/// Decides whether an incoming update wins over the locally-held tag.
///
/// A missing local tag means the record is unknown here and the incoming
/// update wins. An exactly equal tag is the same logical write arriving
/// again and is discarded, which is what makes replays idempotent.
pub fn resolve(local: Option<&VersionTag>, incoming: &VersionTag) -> Resolution {
    match local {
        None => Resolution::Apply,
        Some(held) => match compare(held, incoming) {
            Ordering::Less => Resolution::Apply,
            Ordering::Equal | Ordering::Greater => Resolution::Discard,
        },
    }
}

/// Folds an update into a register value, returning the winner.
///
/// Convergence-law form of [`resolve`], used by property tests:
/// `merge(a, b) == merge(b, a)` and `merge(merge(a, b), c) ==
/// merge(a, merge(b, c))`.
pub fn merge<'a>(a: &'a VersionTag, b: &'a VersionTag) -> &'a VersionTag {
    if resolve(Some(a), b) == Resolution::Apply {
        b
    } else {
        a
    }
}
