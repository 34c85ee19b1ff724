// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName, KeyFormat};
use futures::future;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// One shard of a sharded store, with a stable key and a relative weight.
pub struct Shard {
    pub key: String,
    pub weight: u32,
    pub backend: Arc<dyn BlobAccess>,
}

/// Distributes digests over a set of weighted backends by rendezvous
/// hashing: each digest is owned by the shard with the highest weighted
/// score for it. Adding or removing a shard only moves the keys owned by
/// that shard.
///
/// Sharding is an ownership policy, not a mirror: a failing shard surfaces
/// its error instead of falling over to a sibling.
pub struct ShardingAccess {
    shards: Vec<Shard>,
}

impl ShardingAccess {
    pub fn new(shards: Vec<Shard>) -> Self {
        assert!(!shards.is_empty(), "a sharded store needs at least one shard");
        assert!(
            shards.iter().all(|s| s.weight > 0),
            "shard weights must be positive"
        );
        ShardingAccess { shards }
    }

    fn shard_index_for(&self, digest: &Digest) -> usize {
        let digest_key = digest.key(KeyFormat::WithoutInstance);
        let mut best_index = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (index, shard) in self.shards.iter().enumerate() {
            let mut hasher = DefaultHasher::new();
            shard.key.hash(&mut hasher);
            digest_key.hash(&mut hasher);
            // Weighted rendezvous score; the unit interval is open on both
            // sides so the logarithm stays finite.
            let unit = (hasher.finish() as f64 + 1.0) / (u64::MAX as f64 + 2.0);
            let score = -(shard.weight as f64) / unit.ln();
            if score > best_score {
                best_score = score;
                best_index = index;
            }
        }
        best_index
    }
}

#[async_trait]
impl BlobAccess for ShardingAccess {
    fn get(&self, digest: &Digest) -> Buffer {
        self.shards[self.shard_index_for(digest)].backend.get(digest)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.shards[self.shard_index_for(&digest)]
            .backend
            .put(digest, buffer)
            .await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        if digests.is_empty() {
            return Ok(DigestSet::new());
        }
        let partitions = digests.partition_by(|d| self.shard_index_for(d));
        let queries = partitions.into_iter().map(|(index, digests)| {
            self.shards[index].backend.find_missing(digests)
        });
        let results = future::try_join_all(queries).await?;
        Ok(results
            .into_iter()
            .fold(DigestSet::new(), |acc, missing| acc.union(missing)))
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let queries = self
            .shards
            .iter()
            .map(|shard| shard.backend.get_capabilities(instance_name));
        let results = future::try_join_all(queries).await?;
        let mut results = results.into_iter();
        let first = results.next().expect("at least one shard");
        Ok(results.fold(first, |acc, capabilities| acc.merge(capabilities)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use digest::{DigestSet, KeyFormat};

    use super::{Shard, ShardingAccess};
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::error::StorageError;
    use crate::testutil::{CountingAccess, FailingAccess, TestData};

    fn contents() -> Vec<TestData> {
        vec![
            TestData::from_static(b"one"),
            TestData::from_static(b"two"),
            TestData::from_static(b"three"),
            TestData::from_static(b"four"),
            TestData::from_static(b"five"),
            TestData::from_static(b"six"),
            TestData::from_static(b"seven"),
            TestData::from_static(b"eight"),
        ]
    }

    #[tokio::test]
    async fn placement_is_stable_and_disjoint() {
        let shard_a = Arc::new(CountingAccess::new(MemoryAccess::content_addressed(
            KeyFormat::WithoutInstance,
        )));
        let shard_b = Arc::new(CountingAccess::new(MemoryAccess::content_addressed(
            KeyFormat::WithoutInstance,
        )));
        let storage = ShardingAccess::new(vec![
            Shard {
                key: "shard-a".to_owned(),
                weight: 1,
                backend: shard_a.clone(),
            },
            Shard {
                key: "shard-b".to_owned(),
                weight: 1,
                backend: shard_b.clone(),
            },
        ]);

        for content in contents() {
            storage
                .put(content.digest.clone(), content.user_buffer())
                .await
                .unwrap();
        }

        // Everything is visible through the sharded view.
        let all: DigestSet = contents().iter().map(|c| c.digest.clone()).collect();
        let missing = storage.find_missing(all.clone()).await.unwrap();
        assert!(missing.is_empty());

        // Each blob lives on exactly one shard.
        let missing_a = shard_a.find_missing(all.clone()).await.unwrap();
        let missing_b = shard_b.find_missing(all.clone()).await.unwrap();
        assert_eq!(missing_a.intersection(&missing_b).len(), 0);
        assert_eq!(missing_a.len() + missing_b.len(), all.len());

        // Reads route to the owner, which must hold the content.
        for content in contents() {
            let data = storage
                .get(&content.digest)
                .into_bytes(1024)
                .await
                .unwrap();
            assert_eq!(data, content.bytes);
        }
    }

    #[tokio::test]
    async fn weights_bias_placement() {
        let light = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let heavy = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let storage = ShardingAccess::new(vec![
            Shard {
                key: "light".to_owned(),
                weight: 1,
                backend: light.clone(),
            },
            Shard {
                key: "heavy".to_owned(),
                weight: 100,
                backend: heavy.clone(),
            },
        ]);

        for content in contents() {
            storage
                .put(content.digest.clone(), content.user_buffer())
                .await
                .unwrap();
        }

        let all: DigestSet = contents().iter().map(|c| c.digest.clone()).collect();
        let missing_from_heavy = heavy.find_missing(all.clone()).await.unwrap();
        // With a 100:1 weight ratio the heavy shard should own the large
        // majority of the eight test blobs.
        assert!(missing_from_heavy.len() <= 2, "{missing_from_heavy:?}");
    }

    #[tokio::test]
    async fn shard_failures_do_not_fail_over() {
        let healthy = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let storage = ShardingAccess::new(vec![
            Shard {
                key: "healthy".to_owned(),
                weight: 1,
                backend: healthy.clone(),
            },
            Shard {
                key: "broken".to_owned(),
                weight: 1000,
                backend: Arc::new(FailingAccess::unavailable()),
            },
        ]);

        // With enough digests, some are owned by the broken shard; querying
        // all of them must surface the error rather than mask it.
        let all: DigestSet = contents().iter().map(|c| c.digest.clone()).collect();
        let err = storage.find_missing(all).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "{err:?}");
    }
}
