//! Cache-key generation.

use quarry_core::ids::CacheKey;
use quarry_core::params::CanonicalParams;
use sha2::{Digest, Sha256};

/// Derive the cache key for a normalized request.
///
/// SHA-256 over the owning application name plus the canonical JSON
/// serialization, hex-encoded: stable across process restarts and across
/// implementation languages reading the same canonical form. The
/// application name is part of the digest because identical filters mean
/// different things to different report types.
pub fn fingerprint(app_name: &str, params: &CanonicalParams) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(app_name.as_bytes());
    hasher.update([0u8]); // domain separator between name and payload
    hasher.update(params.to_canonical_json().as_bytes());
    CacheKey::from_digest(hex::encode(hasher.finalize()))
}
