// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName};
use metrics::{decrement_gauge, increment_gauge};

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::{Buffer, BufferSource, ErrorHandler};
use crate::error::StorageError;

/// Default chunk size for streaming reads.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Bounds the duration of every operation with a single per-decorator
/// timeout.
///
/// For `get` the timer cannot simply guard the call: the call returns
/// immediately and the I/O happens when the lazy buffer is consumed, after
/// the stack has unwound. The timer is therefore carried by the returned
/// buffer itself and released through the buffer's error-handler completion
/// path, so it lives exactly as long as the read does.
pub struct DeadlineEnforcingAccess<BA> {
    timeout: Duration,
    underlying: BA,
}

impl<BA> DeadlineEnforcingAccess<BA> {
    pub fn new(underlying: BA, timeout: Duration) -> Self {
        DeadlineEnforcingAccess {
            timeout,
            underlying,
        }
    }
}

struct DeadlineReleaseHandler;

impl DeadlineReleaseHandler {
    fn new() -> Self {
        increment_gauge!("casgrid_storage_reads_in_flight", 1.0, "driver" => "deadline");
        DeadlineReleaseHandler
    }
}

impl ErrorHandler for DeadlineReleaseHandler {
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError> {
        Err(err)
    }
}

impl Drop for DeadlineReleaseHandler {
    // Runs from done() on the completion path, or when the consumer drops
    // the buffer unread; either way the release happens exactly once.
    fn drop(&mut self) {
        decrement_gauge!("casgrid_storage_reads_in_flight", 1.0, "driver" => "deadline");
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::DeadlineExceeded(format!(
            "{operation} did not complete within {timeout:?}"
        ))),
    }
}

#[async_trait]
impl<BA> BlobAccess for DeadlineEnforcingAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let timeout = self.timeout;
        let mut stream = self
            .underlying
            .get(digest)
            .into_chunk_stream(0, DEFAULT_CHUNK_SIZE);

        let deadline_stream = Box::pin(async_stream::stream! {
            loop {
                match tokio::time::timeout_at(deadline, futures::StreamExt::next(&mut stream)).await
                {
                    Ok(Some(item)) => yield item,
                    Ok(None) => return,
                    Err(_) => {
                        yield Err(StorageError::DeadlineExceeded(format!(
                            "Read did not complete within {timeout:?}"
                        )));
                        return;
                    }
                }
            }
        });

        // The inner buffer already verified integrity while streaming.
        Buffer::from_chunk_stream(digest.clone(), BufferSource::Validated, deadline_stream)
            .with_error_handler(Box::new(DeadlineReleaseHandler::new()))
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        with_timeout(self.timeout, "Write", self.underlying.put(digest, buffer)).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        with_timeout(
            self.timeout,
            "FindMissing",
            self.underlying.find_missing(digests),
        )
        .await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        with_timeout(
            self.timeout,
            "GetCapabilities",
            self.underlying.get_capabilities(instance_name),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use digest::{Digest, DigestSet, InstanceName, KeyFormat};

    use super::DeadlineEnforcingAccess;
    use crate::access::{BlobAccess, Capabilities, MemoryAccess};
    use crate::buffer::Buffer;
    use crate::error::StorageError;
    use crate::testutil::TestData;

    /// Parks every operation until the semaphore receives a permit.
    struct StalledAccess {
        inner: MemoryAccess,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl BlobAccess for StalledAccess {
        fn get(&self, digest: &Digest) -> Buffer {
            let gate = self.gate.clone();
            let inner = self.inner.clone();
            let digest = digest.clone();
            Buffer::from_future(
                digest.clone(),
                Box::pin(async move {
                    let _permit = gate.acquire().await.expect("semaphore open");
                    inner.get(&digest)
                }),
            )
        }

        async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
            let _permit = self.gate.acquire().await.expect("semaphore open");
            self.inner.put(digest, buffer).await
        }

        async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
            let _permit = self.gate.acquire().await.expect("semaphore open");
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
    async fn operations_complete_within_deadline() {
        let content = TestData::from_static(b"foobar");
        let storage = DeadlineEnforcingAccess::new(
            MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
            Duration::from_secs(5),
        );

        storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();
        let data = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content.bytes);
        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn stalled_operations_time_out() {
        let content = TestData::from_static(b"foobar");
        let storage = DeadlineEnforcingAccess::new(
            StalledAccess {
                inner: MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
                gate: Arc::new(tokio::sync::Semaphore::new(0)),
            },
            Duration::from_millis(20),
        );

        let err = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded(_)), "{err:?}");

        let err = storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded(_)), "{err:?}");

        // The get call itself returns instantly; the deadline fires when the
        // lazy buffer is consumed.
        let buffer = storage.get(&content.digest);
        let err = buffer.into_bytes(1024).await.unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded(_)), "{err:?}");
    }
}
