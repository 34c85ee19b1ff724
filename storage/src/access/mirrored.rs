// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName, KeyFormat};
use futures::future;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::{Buffer, ErrorHandler};
use crate::error::StorageError;
use crate::replicator::Replicator;

/// How a mirrored pair chooses which backend serves a read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadPolicy {
    RoundRobin,
    ConsistentHash,
    PrimaryWithFallback,
}

/// Treats two backends as redundant copies of the same data set.
///
/// Both backends receive every write, so they only diverge when one of them
/// loses data (eviction, restore from an older snapshot, rebuild). Reads
/// fall back to the other side on a miss, and every observed divergence is
/// handed to a replicator so that the lagging side is repaired.
pub struct MirroredAccess {
    backend_a: Arc<dyn BlobAccess>,
    backend_b: Arc<dyn BlobAccess>,
    replicator_a_to_b: Arc<dyn Replicator>,
    replicator_b_to_a: Arc<dyn Replicator>,
    read_policy: ReadPolicy,
    round_robin_counter: AtomicU64,
    max_put_clone_size_bytes: usize,
}

impl MirroredAccess {
    pub fn new(
        backend_a: Arc<dyn BlobAccess>,
        backend_b: Arc<dyn BlobAccess>,
        replicator_a_to_b: Arc<dyn Replicator>,
        replicator_b_to_a: Arc<dyn Replicator>,
        read_policy: ReadPolicy,
        max_put_clone_size_bytes: usize,
    ) -> Self {
        MirroredAccess {
            backend_a,
            backend_b,
            replicator_a_to_b,
            replicator_b_to_a,
            read_policy,
            round_robin_counter: AtomicU64::new(0),
            max_put_clone_size_bytes,
        }
    }

    /// Whether a read of `digest` starts at backend A.
    fn read_starts_at_a(&self, digest: &Digest) -> bool {
        match self.read_policy {
            ReadPolicy::RoundRobin => {
                self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % 2 == 0
            }
            ReadPolicy::ConsistentHash => {
                let mut hasher = DefaultHasher::new();
                digest.key(KeyFormat::WithoutInstance).hash(&mut hasher);
                hasher.finish() % 2 == 0
            }
            ReadPolicy::PrimaryWithFallback => true,
        }
    }
}

struct MirrorFallbackHandler {
    other_backend: Arc<dyn BlobAccess>,
    repair: Arc<dyn Replicator>,
    digest: Digest,
    consulted: bool,
}

impl ErrorHandler for MirrorFallbackHandler {
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError> {
        if self.consulted || !matches!(err, StorageError::NotFound(_)) {
            return Err(err);
        }
        self.consulted = true;

        // A successful read through this path proves the two sides have
        // diverged: repair the missing side before serving the data, so that
        // completion of the read implies the mirror is whole again for this
        // digest.
        let other_backend = self.other_backend.clone();
        let repair = self.repair.clone();
        let digest = self.digest.clone();
        Ok(Buffer::from_future(
            self.digest.clone(),
            Box::pin(async move {
                match repair.replicate(DigestSet::single(digest.clone())).await {
                    Ok(()) => other_backend.get(&digest),
                    Err(err) => Buffer::from_error(err),
                }
            }),
        ))
    }
}

#[async_trait]
impl BlobAccess for MirroredAccess {
    fn get(&self, digest: &Digest) -> Buffer {
        let (first, second, repair) = if self.read_starts_at_a(digest) {
            (
                &self.backend_a,
                &self.backend_b,
                &self.replicator_b_to_a,
            )
        } else {
            (
                &self.backend_b,
                &self.backend_a,
                &self.replicator_a_to_b,
            )
        };
        first
            .get(digest)
            .with_error_handler(Box::new(MirrorFallbackHandler {
                other_backend: second.clone(),
                repair: repair.clone(),
                digest: digest.clone(),
                consulted: false,
            }))
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let (buffer_a, buffer_b) = buffer.clone_copy(self.max_put_clone_size_bytes)?;
        future::try_join(
            self.backend_a.put(digest.clone(), buffer_a),
            self.backend_b.put(digest, buffer_b),
        )
        .await?;
        Ok(())
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        if digests.is_empty() {
            return Ok(DigestSet::new());
        }
        let (missing_from_a, missing_from_b) = future::try_join(
            self.backend_a.find_missing(digests.clone()),
            self.backend_b.find_missing(digests),
        )
        .await?;

        // Digests present on exactly one side are divergence; repair both
        // directions before answering, so a non-missing answer is durable on
        // both backends.
        let only_in_b = missing_from_a.difference(&missing_from_b);
        let only_in_a = missing_from_b.difference(&missing_from_a);
        let repair_b_to_a = async {
            if only_in_b.is_empty() {
                Ok(())
            } else {
                self.replicator_b_to_a.replicate(only_in_b).await
            }
        };
        let repair_a_to_b = async {
            if only_in_a.is_empty() {
                Ok(())
            } else {
                self.replicator_a_to_b.replicate(only_in_a).await
            }
        };
        future::try_join(repair_b_to_a, repair_a_to_b).await?;

        Ok(missing_from_a.intersection(&missing_from_b))
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let (a, b) = future::try_join(
            self.backend_a.get_capabilities(instance_name),
            self.backend_b.get_capabilities(instance_name),
        )
        .await?;
        Ok(a.merge(b))
    }
}
