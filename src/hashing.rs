//! Stable content hashes.
//!
//! All discriminator keys that are derived from variable-length data (raw
//! bytes, string references, names, call-level sequences) go through SHA-256
//! and are truncated to the width the data model asks for. Truncation keeps
//! the values platform independent and reproducible across runs, which the
//! deterministic-output guarantee depends on.

use sha2::{Digest, Sha256};

/// 64-bit truncated SHA-256 of `data`.
pub fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// 32-bit truncated SHA-256 over a sequence of byte chunks with length
/// framing, so that `["ab", "c"]` and `["a", "bc"]` produce different
/// values. Returns 0 only with negligible probability; callers treat 0 as
/// "no data".
pub fn hash32_chunks<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update((chunk.len() as u64).to_le_bytes());
        hasher.update(chunk);
    }
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
