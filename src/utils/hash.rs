//! Hashing utilities.
//!
//! Two distinct uses, two hashers:
//! - `content_hash` (blake3) guards persisted manifest payloads against
//!   corruption
//! - `fingerprint` (FxHash) derives short stable filenames for pages that
//!   live outside the configured source dir

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Blake3 hash of `data` as a lowercase hex string.
#[inline]
pub fn content_hash<T: AsRef<[u8]> + ?Sized>(data: &T) -> String {
    hex::encode(blake3::hash(data.as_ref()).as_bytes())
}

/// 16-char hex fingerprint of `data`, for filesystem-safe identifiers.
#[inline]
pub fn fingerprint<T: AsRef<[u8]> + ?Sized>(data: &T) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_ref());
    format!("{:016x}", hasher.finish())
}
