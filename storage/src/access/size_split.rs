// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName};
use futures::future;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// Routes blobs smaller than `split_size_bytes` to one backend and larger
/// blobs to another. Useful when one backend is efficient for small objects
/// (e.g. a key/value store) and another for large ones (e.g. object storage).
pub struct SizeSplitAccess<Small, Large> {
    split_size_bytes: usize,
    small: Small,
    large: Large,
}

impl<Small, Large> SizeSplitAccess<Small, Large>
where
    Small: BlobAccess,
    Large: BlobAccess,
{
    pub fn new(split_size_bytes: usize, small: Small, large: Large) -> Self {
        SizeSplitAccess {
            split_size_bytes,
            small,
            large,
        }
    }

    fn is_small(&self, digest: &Digest) -> bool {
        digest.size_bytes() < self.split_size_bytes
    }
}

#[async_trait]
impl<Small, Large> BlobAccess for SizeSplitAccess<Small, Large>
where
    Small: BlobAccess,
    Large: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        if self.is_small(digest) {
            self.small.get(digest)
        } else {
            self.large.get(digest)
        }
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        if self.is_small(&digest) {
            self.small.put(digest, buffer).await
        } else {
            self.large.put(digest, buffer).await
        }
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        if digests.is_empty() {
            return Ok(DigestSet::new());
        }
        let partitions = digests.partition_by(|d| self.is_small(d));
        let small_digests = partitions.get(&true).cloned().unwrap_or_default();
        let large_digests = partitions.get(&false).cloned().unwrap_or_default();
        let (missing_small, missing_large) = future::try_join(
            self.small.find_missing(small_digests),
            self.large.find_missing(large_digests),
        )
        .await?;
        Ok(missing_small.union(missing_large))
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let (small, large) = future::try_join(
            self.small.get_capabilities(instance_name),
            self.large.get_capabilities(instance_name),
        )
        .await?;
        Ok(small.merge(large))
    }
}

#[cfg(test)]
mod tests {
    use digest::{DigestSet, KeyFormat};

    use super::SizeSplitAccess;
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::testutil::TestData;

    #[tokio::test]
    async fn splits_blobs_by_size() {
        let content1 = TestData::from_static(b"foobar");
        let content2 = TestData::from_static(b"foobarxyzzy");

        let storage = SizeSplitAccess::new(
            1 + content1.bytes.len(),
            MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
            MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
        );

        storage
            .put(content1.digest.clone(), content1.user_buffer())
            .await
            .unwrap();
        storage
            .put(content2.digest.clone(), content2.user_buffer())
            .await
            .unwrap();

        // Both blobs are visible through the split.
        let missing = storage
            .find_missing(
                vec![content1.digest.clone(), content2.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert!(missing.is_empty());

        let data = storage
            .get(&content1.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content1.bytes);
        let data = storage
            .get(&content2.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content2.bytes);

        // Each child backend holds exactly the blobs on its side of the
        // threshold.
        let missing = storage
            .small
            .find_missing(
                vec![content1.digest.clone(), content2.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert_eq!(missing, DigestSet::single(content2.digest.clone()));
        let missing = storage
            .large
            .find_missing(
                vec![content1.digest.clone(), content2.digest.clone()]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert_eq!(missing, DigestSet::single(content1.digest.clone()));
    }
}
