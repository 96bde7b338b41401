//! Content fingerprinting for canonical geometry representations
//!
//! A fingerprint is the cache's sole notion of geometric identity: two
//! representations with equal fingerprints are served by the same cache
//! entry. Hashing is SHA-256 over the normalized representation bytes,
//! so fingerprints are stable across processes, machines, and runs.

use crate::error::{ForgeError, ForgeResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a fingerprint digest in bytes
pub const FINGERPRINT_LEN: usize = 32;

/// A deterministic content digest of a canonical geometry representation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Lowercase hex rendering (64 chars), used for cache file names
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a fingerprint back from its hex rendering
    ///
    /// Returns `None` for anything that is not exactly 64 hex chars;
    /// used when scanning a cache directory for existing entries.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; FINGERPRINT_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Compute the fingerprint of a canonical representation
///
/// Line endings are normalized (CRLF and lone CR fold to LF) before
/// hashing: geometry kernels emit platform-dependent line endings for
/// otherwise identical trees, and those must not count as distinct
/// geometry. No other normalization is applied; byte content is
/// otherwise authoritative.
pub fn fingerprint(representation: &[u8]) -> ForgeResult<Fingerprint> {
    if representation.is_empty() {
        return Err(ForgeError::EmptyRepresentation);
    }

    let mut hasher = Sha256::new();
    let mut i = 0;
    while i < representation.len() {
        let b = representation[i];
        if b == b'\r' {
            hasher.update([b'\n']);
            if representation.get(i + 1) == Some(&b'\n') {
                i += 1;
            }
        } else {
            hasher.update([b]);
        }
        i += 1;
    }

    let digest = hasher.finalize();
    Ok(Fingerprint(digest.into()))
}
