//! Record key digests.
//!
//! A [`Digest`] is the 20-byte content hash that identifies a record within
//! a namespace. It is the key under which the index tree, the pickle codec,
//! and every wire message (`MIGRATE`, `RW`) address a record.

use std::fmt;

/// 20-byte content digest identifying a record within a namespace.
///
/// Computed as the first 20 bytes of a BLAKE3 hash of `set:key`. BLAKE3 is
/// used rather than a dedicated SHA-1/RIPEMD160 crate because it is already
/// on the dependency graph for other hashing needs in this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Digest(pub [u8; 20]);

impl Digest {
    /// Computes the digest for a `(set, key)` pair.
    ///
    /// `set` may be empty for the default (unnamed) set.
    #[must_use]
    pub fn compute(set: &str, key: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(set.as_bytes());
        hasher.update(&[0u8]); // separator: set names cannot contain a NUL byte
        hasher.update(key);
        let hash = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[..20]);
        Self(bytes)
    }

    /// Wraps a raw 20-byte digest as received over the wire.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_digest() {
        let a = Digest::compute("users", b"alice");
        let b = Digest::compute("users", b"alice");
        assert_eq!(a, b);
    }

    #[test]
    fn different_sets_differ() {
        let a = Digest::compute("users", b"alice");
        let b = Digest::compute("accounts", b"alice");
        assert_ne!(a, b);
    }

    #[test]
    fn different_keys_differ() {
        let a = Digest::compute("users", b"alice");
        let b = Digest::compute("users", b"bob");
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_lowercase_hex() {
        let d = Digest::from_bytes([0xAB; 20]);
        assert_eq!(d.to_string(), "ab".repeat(20));
    }

    #[test]
    fn set_boundary_does_not_alias() {
        // "a" + "" + "bc" must not collide with "" + "" + "abc" style boundary shifts.
        let a = Digest::compute("a", b"bc");
        let b = Digest::compute("ab", b"c");
        assert_ne!(a, b);
    }
}
