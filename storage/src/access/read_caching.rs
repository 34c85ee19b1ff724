// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName};
use futures::future;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::{Buffer, ErrorHandler};
use crate::error::StorageError;

/// Reads through a "fast" backend (e.g. local) backed by a "slow" one (e.g.
/// remote). A miss on the fast side falls through to the slow side, and the
/// returned buffer is split so one half repopulates the fast backend while
/// the other is served to the caller. Blobs too large to split within the
/// clone bound are served without repopulating the cache rather than failing
/// the read.
pub struct ReadCachingAccess<Fast, Slow> {
    fast: Arc<Fast>,
    slow: Arc<Slow>,
    max_replication_size_bytes: usize,
}

impl<Fast, Slow> ReadCachingAccess<Fast, Slow>
where
    Fast: BlobAccess,
    Slow: BlobAccess,
{
    pub fn new(fast: Fast, slow: Slow, max_replication_size_bytes: usize) -> Self {
        ReadCachingAccess {
            fast: Arc::new(fast),
            slow: Arc::new(slow),
            max_replication_size_bytes,
        }
    }
}

struct FallThroughHandler<Fast, Slow> {
    fast: Arc<Fast>,
    slow: Arc<Slow>,
    digest: Digest,
    max_replication_size_bytes: usize,
    consulted: bool,
}

impl<Fast, Slow> ErrorHandler for FallThroughHandler<Fast, Slow>
where
    Fast: BlobAccess,
    Slow: BlobAccess,
{
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError> {
        if self.consulted || !matches!(err, StorageError::NotFound(_)) {
            return Err(err);
        }
        self.consulted = true;

        let slow_buffer = self.slow.get(&self.digest);
        let within_bound = matches!(
            slow_buffer.size_bytes(),
            Ok(size) if size <= self.max_replication_size_bytes
        );
        if !within_bound {
            return Ok(slow_buffer);
        }

        let (for_caller, for_fast) = slow_buffer.clone_copy(self.max_replication_size_bytes)?;
        let fast = self.fast.clone();
        let digest = self.digest.clone();
        // Repopulate the fast side before the caller's half resolves. A
        // failed cache fill must not fail the read.
        Ok(Buffer::from_future(
            self.digest.clone(),
            Box::pin(async move {
                if let Err(err) = fast.put(digest.clone(), for_fast).await {
                    log::error!("Failed to repopulate fast storage with {digest:?}: {err}");
                }
                for_caller
            }),
        ))
    }
}

#[async_trait]
impl<Fast, Slow> BlobAccess for ReadCachingAccess<Fast, Slow>
where
    Fast: BlobAccess,
    Slow: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        self.fast
            .get(digest)
            .with_error_handler(Box::new(FallThroughHandler {
                fast: self.fast.clone(),
                slow: self.slow.clone(),
                digest: digest.clone(),
                max_replication_size_bytes: self.max_replication_size_bytes,
                consulted: false,
            }))
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.fast.put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        if digests.is_empty() {
            return Ok(DigestSet::new());
        }
        let (missing_fast, missing_slow) = future::try_join(
            self.fast.find_missing(digests.clone()),
            self.slow.find_missing(digests),
        )
        .await?;
        Ok(missing_fast.intersection(&missing_slow))
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let (fast, slow) = future::try_join(
            self.fast.get_capabilities(instance_name),
            self.slow.get_capabilities(instance_name),
        )
        .await?;
        Ok(fast.merge(slow))
    }
}
