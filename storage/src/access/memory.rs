// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::{Digest, DigestSet, InstanceName, KeyFormat};
use parking_lot::Mutex;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// An in-memory terminal backend, used for tests and as the innermost leaf of
/// small deployments.
///
/// Content-addressed stores verify contents against the digest when read back
/// and evict entries that fail verification. Indexed stores (e.g. the Action
/// Cache, whose payloads are keyed by an action digest rather than their own
/// hash) serve contents as-is.
#[derive(Clone)]
pub struct MemoryAccess {
    key_format: KeyFormat,
    content_addressed: bool,
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryAccess {
    pub fn content_addressed(key_format: KeyFormat) -> Self {
        MemoryAccess {
            key_format,
            content_addressed: true,
            blobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn indexed(key_format: KeyFormat) -> Self {
        MemoryAccess {
            key_format,
            content_addressed: false,
            blobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl BlobAccess for MemoryAccess {
    fn get(&self, digest: &Digest) -> Buffer {
        let key = digest.key(self.key_format);
        let blob = self.blobs.lock().get(&key).cloned();
        match blob {
            Some(data) if self.content_addressed => {
                // Evict the entry if it fails verification, so subsequent
                // reads miss instead of observing the same corruption.
                let blobs = self.blobs.clone();
                let evict_key = key;
                Buffer::from_backend_bytes(
                    digest.clone(),
                    data,
                    Arc::new(move |ok| {
                        if !ok {
                            blobs.lock().remove(&evict_key);
                        }
                    }),
                )
            }
            Some(data) => Buffer::from_validated_bytes(data),
            None => Buffer::from_error(StorageError::NotFound(key)),
        }
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let key = digest.key(self.key_format);
        let data = buffer.into_bytes(usize::MAX).await?;
        self.blobs.lock().insert(key, data);
        Ok(())
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let blobs = self.blobs.lock();
        Ok(digests
            .into_iter()
            .filter(|d| !blobs.contains_key(&d.key(self.key_format)))
            .collect())
    }

    async fn get_capabilities(
        &self,
        _instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        Ok(Capabilities::default_cas())
    }
}

#[cfg(test)]
mod tests {
    use digest::{DigestSet, KeyFormat};

    use super::MemoryAccess;
    use crate::access::BlobAccess;
    use crate::buffer::Buffer;
    use crate::error::StorageError;
    use crate::testutil::TestData;

    #[tokio::test]
    async fn basic_read_write() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        let content = TestData::from_static(b"foobar");

        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);

        storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();

        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());

        let data = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content.bytes);
    }

    #[tokio::test]
    async fn get_of_absent_digest_is_not_found() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        let content = TestData::from_static(b"foobar");

        let err = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn put_verifies_user_content() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        let content = TestData::from_static(b"foobar");

        let err = storage
            .put(
                content.digest.clone(),
                Buffer::from_user_bytes(
                    content.digest.clone(),
                    bytes::Bytes::from_static(b"not foobar"),
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidSize { .. }), "{err:?}");

        // The failed write must not become visible.
        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_entries_are_evicted_on_read() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        let content = TestData::from_static(b"foobar");
        let wrong = TestData::from_static(b"barfoo");

        // Store mismatched bytes directly, bypassing write verification.
        storage
            .put(content.digest.clone(), Buffer::from_validated_bytes(wrong.bytes.clone()))
            .await
            .unwrap();

        let err = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidHash { is_data_loss: true, .. }),
            "{err:?}"
        );

        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn instance_scoping_by_key_format() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithInstance);
        let content = TestData::from_static(b"foobar");
        let elsewhere = content
            .digest
            .with_instance_name(digest::InstanceName::new("other").unwrap());

        storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();

        let missing = storage
            .find_missing(
                vec![content.digest.clone(), elsewhere.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing.contains(&elsewhere));
    }
}
