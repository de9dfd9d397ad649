//! Stable fingerprints for canonical systems and batches.
//!
//! Fingerprints are xxh64 digests of the canonical text serialization, so
//! they are identical across runs, platforms and processes as long as the
//! codec's output format is unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Seed for every fingerprint. Changing it invalidates all stored ids.
const FINGERPRINT_SEED: u64 = 0;

/// A 64-bit content fingerprint, displayed as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Fingerprint a text serialization.
pub fn fingerprint_text(text: &str) -> Fingerprint {
    Fingerprint(xxh64(text.as_bytes(), FINGERPRINT_SEED))
}

/// Fingerprint an ordered sequence of fingerprints (e.g. a batch).
///
/// Order-sensitive: the same members in a different order give a different id.
pub fn combine_fingerprints<I>(parts: I) -> Fingerprint
where
    I: IntoIterator<Item = Fingerprint>,
{
    let mut hasher = Xxh64::new(FINGERPRINT_SEED);
    for part in parts {
        hasher.write(&part.0.to_le_bytes());
    }
    Fingerprint(hasher.finish())
}
