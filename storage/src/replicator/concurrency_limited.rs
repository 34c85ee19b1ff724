// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::DigestSet;
use tokio::sync::Semaphore;

use crate::error::StorageError;
use crate::replicator::Replicator;

/// Bounds the number of in-flight replications across all callers. Excess
/// requests wait for a permit; dropping a waiting request releases its place
/// in line, so cancellation is honored.
pub struct ConcurrencyLimitedReplicator {
    base: Arc<dyn Replicator>,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimitedReplicator {
    pub fn new(base: Arc<dyn Replicator>, max_concurrency: usize) -> Self {
        ConcurrencyLimitedReplicator {
            base,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }
}

#[async_trait]
impl Replicator for ConcurrencyLimitedReplicator {
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            StorageError::Internal("Replication semaphore has been closed".to_owned())
        })?;
        self.base.replicate(digests).await
    }
}
