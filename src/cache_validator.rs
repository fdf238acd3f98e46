use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Integrity wrapper for records persisted to local disk (the durable token
/// cache).
///
/// The record is stored as a JSON string next to its SHA-256 checksum. On
/// read, a record whose checksum does not match is dropped, and the caller
/// treats the cache as empty and fetches a fresh value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    /// The cached record (JSON string)
    pub data: String,
    /// SHA-256 checksum of the data (hex encoded)
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns true if the checksum matches, false if tampered
    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Serializes `record` and wraps it with its checksum, ready to be
    /// written to disk.
    pub fn seal<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(record)?;
        serde_json::to_string(&Self::new(data))
    }

    /// Reads back a sealed record.
    ///
    /// Returns `None` for invalid JSON, checksum mismatch, or a payload that
    /// does not decode as `T`.
    pub fn open<T: DeserializeOwned>(serialized: &str) -> Option<T> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;

        if !entry.is_valid() {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            return None;
        }

        serde_json::from_str(&entry.data).ok()
    }
}
