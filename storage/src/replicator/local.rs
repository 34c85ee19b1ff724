// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::DigestSet;

use crate::access::BlobAccess;
use crate::error::StorageError;
use crate::replicator::Replicator;

/// Copies digests one by one by reading from the source and writing into the
/// sink. Used directly when no coordination between callers is needed; the
/// other engines wrap it.
pub struct LocalReplicator {
    source: Arc<dyn BlobAccess>,
    sink: Arc<dyn BlobAccess>,
}

impl LocalReplicator {
    pub fn new(source: Arc<dyn BlobAccess>, sink: Arc<dyn BlobAccess>) -> Self {
        LocalReplicator { source, sink }
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        for digest in digests.iter() {
            let buffer = self.source.get(digest);
            match self.sink.put(digest.clone(), buffer).await {
                Ok(()) => {}
                // The blob was evicted from the source before we got to it.
                // Skip it; the next FindMissing round will surface it again.
                Err(StorageError::NotFound(msg)) => {
                    log::warn!("Digest {digest:?} disappeared before replication: {msg}");
                    metrics::counter!("casgrid_storage_replication_skipped_total", 1);
                }
                // Terminal sink conditions abort the rest of the batch.
                Err(err @ StorageError::PermissionDenied(_))
                | Err(err @ StorageError::ResourceExhausted(_)) => return Err(err),
                Err(err) => {
                    log::error!("Failed to replicate {digest:?}: {err}");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use digest::{DigestSet, KeyFormat};

    use super::LocalReplicator;
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::replicator::Replicator;
    use crate::testutil::TestData;

    #[tokio::test]
    async fn copies_source_to_sink() {
        let content1 = TestData::from_static(b"foobar");
        let content2 = TestData::from_static(b"xyzzy");

        let source = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let sink = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        for content in [&content1, &content2] {
            source
                .put(content.digest.clone(), content.user_buffer())
                .await
                .unwrap();
        }

        let replicator = LocalReplicator::new(source, sink.clone());
        replicator
            .replicate(
                vec![content1.digest.clone(), content2.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let missing = sink
            .find_missing(
                vec![content1.digest.clone(), content2.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn missing_source_digests_are_skipped() {
        let present = TestData::from_static(b"foobar");
        let evicted = TestData::from_static(b"gone");

        let source = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let sink = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        source
            .put(present.digest.clone(), present.user_buffer())
            .await
            .unwrap();

        let replicator = LocalReplicator::new(source, sink.clone());
        replicator
            .replicate(
                vec![present.digest.clone(), evicted.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let missing = sink
            .find_missing(
                vec![present.digest.clone(), evicted.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert_eq!(missing, DigestSet::single(evicted.digest.clone()));
    }
}
