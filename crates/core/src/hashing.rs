//! Content addressing for stored media.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a blob. Two attachments with the same digest are
/// the same object.
pub fn content_hash(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}
