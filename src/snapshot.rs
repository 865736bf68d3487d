//! Post-make snapshots: an opportunistic cache of the toolchain tree after a successful `make`,
//! keyed by (builder, revision) and stored as a gzipped tar in an opaque object store. Existence
//! is advisory -- a miss just means a full build runs -- so this module only needs a narrow
//! get/put seam, not a real object-storage client (that's explicitly out of scope, §1).

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::errors::TransportError;
use crate::git::CommitHash;

/// Opaque key identifying a snapshot: `<builder-name>/<revision>.tar.gz` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotRef {
    pub builder_name: String,
    pub revision: CommitHash,
}

impl SnapshotRef {
    pub fn new(builder_name: impl Into<String>, revision: CommitHash) -> Self {
        Self {
            builder_name: builder_name.into(),
            revision,
        }
    }

    pub fn object_key(&self) -> String {
        format!("{}/{}.tar.gz", self.builder_name, self.revision)
    }
}

/// The object store snapshots live in. Production would be an opaque blob store (GCS, S3, ...);
/// out of scope per §1, so only the get/put/exists contract the build driver needs is specified
/// here.
#[allow(async_fn_in_trait)]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &SnapshotRef) -> Result<Option<Bytes>, TransportError>;
    async fn put(&self, key: &SnapshotRef, tar_gz: Bytes) -> Result<(), TransportError>;
}

/// In-memory snapshot store for `run-build` and tests.
#[derive(Default)]
pub struct FakeSnapshotStore {
    objects: Mutex<std::collections::HashMap<String, Bytes>>,
}

impl FakeSnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SnapshotStore for FakeSnapshotStore {
    async fn get(&self, key: &SnapshotRef) -> Result<Option<Bytes>, TransportError> {
        Ok(self.objects.lock().get(&key.object_key()).cloned())
    }

    async fn put(&self, key: &SnapshotRef, tar_gz: Bytes) -> Result<(), TransportError> {
        self.objects.lock().insert(key.object_key(), tar_gz);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit() {
        let store = FakeSnapshotStore::new();
        let key = SnapshotRef::new("linux-amd64", CommitHash::new("deadbeef"));
        assert!(store.get(&key).await.unwrap().is_none());

        store.put(&key, Bytes::from_static(b"tarball")).await.unwrap();
        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"tarball"));
    }

    #[test]
    fn object_key_format() {
        let key = SnapshotRef::new("linux-amd64-race", CommitHash::new("abc123"));
        assert_eq!(key.object_key(), "linux-amd64-race/abc123.tar.gz");
    }
}
