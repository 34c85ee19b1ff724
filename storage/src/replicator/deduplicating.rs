// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use digest::{DigestSet, KeyFormat};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::replicator::Replicator;

type SharedReplication = Shared<BoxFuture<'static, Result<(), StorageError>>>;

struct State {
    // Weak handles: when every waiter for a digest goes away, the underlying
    // work is dropped with them.
    in_flight: HashMap<String, WeakShared<BoxFuture<'static, Result<(), StorageError>>>>,
    recent_successes: HashMap<String, Instant>,
}

/// Coalesces concurrent replication requests for the same digest onto one
/// execution: late arrivals attach to the in-flight future and every waiter
/// observes the same outcome. A short-lived success cache additionally
/// suppresses re-replication of digests that were just copied.
pub struct DeduplicatingReplicator {
    base: Arc<dyn Replicator>,
    key_format: KeyFormat,
    success_ttl: Duration,
    state: Arc<Mutex<State>>,
}

impl DeduplicatingReplicator {
    pub fn new(base: Arc<dyn Replicator>, key_format: KeyFormat, success_ttl: Duration) -> Self {
        DeduplicatingReplicator {
            base,
            key_format,
            success_ttl,
            state: Arc::new(Mutex::new(State {
                in_flight: HashMap::new(),
                recent_successes: HashMap::new(),
            })),
        }
    }

    /// Obtain the future to wait on for a single digest, or `None` when a
    /// fresh success makes replication unnecessary.
    fn replication_for(&self, digest: &digest::Digest) -> Option<SharedReplication> {
        let key = digest.key(self.key_format);
        let mut state = self.state.lock();

        match state.recent_successes.get(&key) {
            Some(expiry) if *expiry > Instant::now() => return None,
            Some(_) => {
                state.recent_successes.remove(&key);
            }
            None => {}
        }

        if let Some(weak) = state.in_flight.get(&key) {
            if let Some(shared) = weak.upgrade() {
                return Some(shared);
            }
            state.in_flight.remove(&key);
        }

        let base = self.base.clone();
        let state_arc = self.state.clone();
        let success_ttl = self.success_ttl;
        let completion_key = key.clone();
        let single = DigestSet::single(digest.clone());
        let shared = async move {
            let result = base.replicate(single).await;
            let mut state = state_arc.lock();
            state.in_flight.remove(&completion_key);
            if result.is_ok() && success_ttl > Duration::ZERO {
                state
                    .recent_successes
                    .insert(completion_key, Instant::now() + success_ttl);
            }
            result
        }
        .boxed()
        .shared();

        if let Some(weak) = shared.downgrade() {
            state.in_flight.insert(key, weak);
        }
        Some(shared)
    }
}

#[async_trait]
impl Replicator for DeduplicatingReplicator {
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        let waits: Vec<SharedReplication> = digests
            .iter()
            .filter_map(|digest| self.replication_for(digest))
            .collect();
        futures::future::try_join_all(waits).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use digest::{Digest, DigestSet, InstanceName, KeyFormat};

    use super::DeduplicatingReplicator;
    use crate::access::{BlobAccess, Capabilities, MemoryAccess};
    use crate::buffer::Buffer;
    use crate::error::StorageError;
    use crate::replicator::{LocalReplicator, Replicator};
    use crate::testutil::{CountingAccess, TestData};

    /// Blocks writes until the gate receives permits.
    struct GatedAccess {
        inner: MemoryAccess,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl BlobAccess for GatedAccess {
        fn get(&self, digest: &Digest) -> Buffer {
            self.inner.get(digest)
        }

        async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
            let _permit = self.gate.acquire().await.expect("gate open");
            self.inner.put(digest, buffer).await
        }

        async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
            self.inner.find_missing(digests).await
        }

        async fn get_capabilities(
            &self,
            instance_name: &InstanceName,
        ) -> Result<Capabilities, StorageError> {
            self.inner.get_capabilities(instance_name).await
        }
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce() {
        let content = TestData::from_static(b"foobar");
        let source = Arc::new(CountingAccess::new(MemoryAccess::content_addressed(
            KeyFormat::WithoutInstance,
        )));
        source
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let sink = Arc::new(CountingAccess::new(GatedAccess {
            inner: MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
            gate: gate.clone(),
        }));

        let replicator = Arc::new(DeduplicatingReplicator::new(
            Arc::new(LocalReplicator::new(source.clone(), sink.clone())),
            KeyFormat::WithoutInstance,
            Duration::from_secs(60),
        ));

        // Launch several requests for the same digest while the first is
        // still blocked inside the sink write.
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let replicator = replicator.clone();
                let digest = content.digest.clone();
                tokio::spawn(async move { replicator.replicate(DigestSet::single(digest)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(3);
        for task in tasks {
            task.await.expect("task not cancelled").unwrap();
        }

        // Exactly one read of the source and one write into the sink.
        assert_eq!(source.counts().1, 1);
        assert_eq!(sink.counts().2, 1);

        // The success cache also absorbs a fresh request after completion.
        replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert_eq!(source.counts().1, 1);
        assert_eq!(sink.counts().2, 1);
    }

    #[tokio::test]
    async fn expired_successes_replicate_again() {
        let content = TestData::from_static(b"foobar");
        let source = Arc::new(CountingAccess::new(MemoryAccess::content_addressed(
            KeyFormat::WithoutInstance,
        )));
        source
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();

        let replicator = DeduplicatingReplicator::new(
            Arc::new(LocalReplicator::new(
                source.clone(),
                Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance)),
            )),
            KeyFormat::WithoutInstance,
            Duration::from_millis(10),
        );

        replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert_eq!(source.counts().1, 2);
    }

    #[tokio::test]
    async fn failures_are_shared_and_not_cached() {
        let content = TestData::from_static(b"foobar");
        let source = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        source
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();
        let sink = Arc::new(CountingAccess::new(crate::testutil::FailingAccess::new(
            StorageError::Unavailable("sink down".to_owned()),
        )));

        let replicator = DeduplicatingReplicator::new(
            Arc::new(LocalReplicator::new(Arc::new(source), sink.clone())),
            KeyFormat::WithoutInstance,
            Duration::from_secs(60),
        );

        let err = replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "{err:?}");

        // Failures must not populate the success cache.
        let err = replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "{err:?}");
        assert_eq!(sink.counts().2, 2);
    }
}
