//! Stable identifiers derived with blake3.

/// Document id for a record in the clustered backend, where raw paths are
/// too long and contain characters that need escaping.
pub fn record_id(path: &str) -> String {
    blake3::hash(path.as_bytes()).to_hex().to_string()
}

/// Hex digest of file contents, stored on every record.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
