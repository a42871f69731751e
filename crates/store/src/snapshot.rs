//! Encrypted snapshot files for the embedded profile.
//!
//! On graceful shutdown (and at the autosave interval) every persistent
//! collection plus the metrics bucket ring is serialized to JSON,
//! AEAD-encrypted, and written with an atomic rename so a crash mid-write
//! never corrupts the previous snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use doorman_crypto::MasterKey;

use crate::error::StoreError;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Everything a snapshot carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotData {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Collection name -> documents.
    pub collections: BTreeMap<String, Vec<Value>>,
    /// Opaque metrics ring state, restored into the metrics store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl SnapshotData {
    #[must_use]
    pub fn new(collections: BTreeMap<String, Vec<Value>>, metrics: Option<Value>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            collections,
            metrics,
        }
    }
}

/// Serialize, encrypt, and atomically write a snapshot to `path`.
pub fn write_snapshot(
    path: &Path,
    data: &SnapshotData,
    key: &MasterKey,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec(data)
        .map_err(|e| StoreError::Backend(format!("snapshot encode failed: {e}")))?;
    let blob = doorman_crypto::encrypt_blob(&json, key)
        .map_err(|e| StoreError::Backend(format!("snapshot encrypt failed: {e}")))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &blob)
        .map_err(|e| StoreError::Backend(format!("snapshot write failed: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::Backend(format!("snapshot rename failed: {e}")))?;
    Ok(())
}

/// Read and decrypt a snapshot written by [`write_snapshot`].
///
/// A missing file returns `Ok(None)`; a present-but-invalid file is an
/// error so startup can refuse to silently discard state.
pub fn read_snapshot(path: &Path, key: &MasterKey) -> Result<Option<SnapshotData>, StoreError> {
    let blob = match std::fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Backend(format!("snapshot read failed: {e}"))),
    };
    let json = doorman_crypto::decrypt_blob(&blob, key)
        .map_err(|e| StoreError::Backend(format!("snapshot decrypt failed: {e}")))?;
    let data: SnapshotData = serde_json::from_slice(&json)
        .map_err(|e| StoreError::Backend(format!("snapshot decode failed: {e}")))?;
    if data.version != SNAPSHOT_VERSION {
        return Err(StoreError::Backend(format!(
            "unsupported snapshot version {}",
            data.version
        )));
    }
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> MasterKey {
        doorman_crypto::parse_master_key(&"ab".repeat(32)).unwrap()
    }

    fn sample() -> SnapshotData {
        let mut collections = BTreeMap::new();
        collections.insert(
            "apis".to_owned(),
            vec![json!({"api_name": "echo", "api_version": "v1"})],
        );
        collections.insert("users".to_owned(), vec![json!({"username": "alice"})]);
        SnapshotData::new(collections, Some(json!({"buckets": []})))
    }

    #[test]
    fn roundtrip_restore_equals_write() {
        let dir = std::env::temp_dir().join(format!("doorman-snap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.snapshot");

        let data = sample();
        write_snapshot(&path, &data, &key()).unwrap();
        let restored = read_snapshot(&path, &key()).unwrap().unwrap();
        assert_eq!(restored, data);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_none() {
        let path = std::env::temp_dir().join("doorman-snap-definitely-missing");
        assert!(read_snapshot(&path, &key()).unwrap().is_none());
    }

    #[test]
    fn wrong_key_is_an_error() {
        let dir = std::env::temp_dir().join(format!("doorman-snap-k-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.snapshot");

        write_snapshot(&path, &sample(), &key()).unwrap();
        let other = doorman_crypto::parse_master_key(&"cd".repeat(32)).unwrap();
        assert!(read_snapshot(&path, &other).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_is_not_plaintext() {
        let dir = std::env::temp_dir().join(format!("doorman-snap-p-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.snapshot");

        write_snapshot(&path, &sample(), &key()).unwrap();
        let raw = std::fs::read(&path).unwrap();
        let raw_str = String::from_utf8_lossy(&raw);
        assert!(!raw_str.contains("alice"));
        assert!(!raw_str.contains("api_name"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
