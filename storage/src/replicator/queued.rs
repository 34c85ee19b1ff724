// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::DigestSet;
use tokio::sync::oneshot;

use crate::error::StorageError;
use crate::replicator::Replicator;

struct Request {
    digests: DigestSet,
    reply: oneshot::Sender<Result<(), StorageError>>,
}

/// Runs replication requests on a fixed worker pool fed by a bounded
/// in-process queue. When the queue is full, callers block in `replicate`
/// until a slot frees up; back-pressure is the queue's natural response to
/// overload.
pub struct QueuedReplicator {
    sender: async_channel::Sender<Request>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl QueuedReplicator {
    /// Must be called from within a Tokio runtime, as the worker pool is
    /// spawned immediately.
    pub fn new(base: Arc<dyn Replicator>, queue_capacity: usize, worker_count: usize) -> Self {
        let (sender, receiver) = async_channel::bounded::<Request>(queue_capacity);
        let workers = (0..worker_count)
            .map(|_| {
                let receiver = receiver.clone();
                let base = base.clone();
                tokio::spawn(async move {
                    while let Ok(request) = receiver.recv().await {
                        let result = base.replicate(request.digests).await;
                        // The requester may have gone away; the work is done
                        // either way.
                        let _ = request.reply.send(result);
                    }
                })
            })
            .collect();
        QueuedReplicator { sender, workers }
    }
}

impl Drop for QueuedReplicator {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[async_trait]
impl Replicator for QueuedReplicator {
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Request { digests, reply })
            .await
            .map_err(|_| {
                StorageError::Unavailable("Replication queue has shut down".to_owned())
            })?;
        response.await.map_err(|_| {
            StorageError::Cancelled("Replication worker dropped the request".to_owned())
        })?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use digest::{DigestSet, KeyFormat};

    use super::QueuedReplicator;
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::replicator::{LocalReplicator, Replicator};
    use crate::testutil::TestData;

    #[tokio::test]
    async fn requests_complete_through_the_pool() {
        let content = TestData::from_static(b"foobar");
        let source = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let sink = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        source
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();

        let replicator = QueuedReplicator::new(
            Arc::new(LocalReplicator::new(source, sink.clone())),
            4,
            2,
        );
        replicator
            .replicate(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();

        let missing = sink
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_share_the_pool() {
        let contents: Vec<TestData> = vec![
            TestData::from_static(b"one"),
            TestData::from_static(b"two"),
            TestData::from_static(b"three"),
            TestData::from_static(b"four"),
        ];
        let source = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        let sink = Arc::new(MemoryAccess::content_addressed(KeyFormat::WithoutInstance));
        for content in &contents {
            source
                .put(content.digest.clone(), content.user_buffer())
                .await
                .unwrap();
        }

        let replicator = Arc::new(QueuedReplicator::new(
            Arc::new(LocalReplicator::new(source, sink.clone())),
            1,
            2,
        ));

        let tasks: Vec<_> = contents
            .iter()
            .map(|content| {
                let replicator = replicator.clone();
                let digest = content.digest.clone();
                tokio::spawn(async move { replicator.replicate(DigestSet::single(digest)).await })
            })
            .collect();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("replication finished")
                .expect("task not cancelled")
                .expect("replication succeeded");
        }

        let missing = sink
            .find_missing(contents.iter().map(|c| c.digest.clone()).collect())
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
