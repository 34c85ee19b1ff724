// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Engines that copy blobs from a source backend to a sink backend, used to
//! repair divergence between mirrors.

use async_trait::async_trait;
use digest::DigestSet;

use crate::error::StorageError;

mod concurrency_limited;
mod deduplicating;
mod local;
mod queued;
mod remote;

pub use concurrency_limited::ConcurrencyLimitedReplicator;
pub use deduplicating::DeduplicatingReplicator;
pub use local::LocalReplicator;
pub use queued::QueuedReplicator;
pub use remote::{RemoteReplicator, ReplicationClient};

/// Copies all digests in a request from a fixed source backend to a fixed
/// sink backend. Implementations differ in how they coordinate concurrent
/// requests, not in what a single copy does.
#[async_trait]
pub trait Replicator: Send + Sync + 'static {
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError>;
}

#[async_trait]
impl<R> Replicator for std::sync::Arc<R>
where
    R: Replicator + ?Sized,
{
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        (**self).replicate(digests).await
    }
}
