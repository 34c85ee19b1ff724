// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName};
use rand::Rng;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::{Buffer, ErrorHandler};
use crate::error::StorageError;

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        exponential.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
    }
}

/// Retries operations whose failures are transient (`unavailable`). All other
/// error codes pass straight through; notably data-integrity failures must
/// not be retried, since re-reading corrupt contents cannot help.
///
/// Writes are never replayed: the buffer was consumed by the first attempt.
pub struct RetryingAccess<BA> {
    policy: RetryPolicy,
    underlying: Arc<BA>,
}

impl<BA> RetryingAccess<BA>
where
    BA: BlobAccess,
{
    pub fn new(underlying: BA, policy: RetryPolicy) -> Self {
        RetryingAccess {
            policy,
            underlying: Arc::new(underlying),
        }
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(err) if err.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    log::warn!("{operation} failed, retrying in {delay:?}: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

struct RetryHandler<BA> {
    underlying: Arc<BA>,
    digest: Digest,
    policy: RetryPolicy,
    attempt: u32,
}

impl<BA> ErrorHandler for RetryHandler<BA>
where
    BA: BlobAccess,
{
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError> {
        if !err.is_retryable() || self.attempt + 1 >= self.policy.max_attempts {
            return Err(err);
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        log::warn!(
            "Read of {:?} failed, retrying in {delay:?}: {err}",
            self.digest
        );
        let underlying = self.underlying.clone();
        let digest = self.digest.clone();
        Ok(Buffer::from_future(
            self.digest.clone(),
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                underlying.get(&digest)
            }),
        ))
    }
}

#[async_trait]
impl<BA> BlobAccess for RetryingAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        self.underlying
            .get(digest)
            .with_error_handler(Box::new(RetryHandler {
                underlying: self.underlying.clone(),
                digest: digest.clone(),
                policy: self.policy,
                attempt: 0,
            }))
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.underlying.put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.with_retries("FindMissing", || {
            self.underlying.find_missing(digests.clone())
        })
        .await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.with_retries("GetCapabilities", || {
            self.underlying.get_capabilities(instance_name)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use digest::{Digest, DigestSet, InstanceName, KeyFormat};

    use super::{RetryPolicy, RetryingAccess};
    use crate::access::{BlobAccess, Capabilities, MemoryAccess};
    use crate::buffer::Buffer;
    use crate::error::StorageError;
    use crate::testutil::TestData;

    /// Fails with `unavailable` the first `failures` times each operation is
    /// attempted.
    struct FlakyAccess {
        inner: MemoryAccess,
        failures: usize,
        seen: AtomicUsize,
    }

    impl FlakyAccess {
        fn should_fail(&self) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst) < self.failures
        }
    }

    #[async_trait]
    impl BlobAccess for FlakyAccess {
        fn get(&self, digest: &Digest) -> Buffer {
            if self.should_fail() {
                Buffer::from_error(StorageError::Unavailable("flaky".to_owned()))
            } else {
                self.inner.get(digest)
            }
        }

        async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
            self.inner.put(digest, buffer).await
        }

        async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
            if self.should_fail() {
                return Err(StorageError::Unavailable("flaky".to_owned()));
            }
            self.inner.find_missing(digests).await
        }

        async fn get_capabilities(
            &self,
            instance_name: &InstanceName,
        ) -> Result<Capabilities, StorageError> {
            self.inner.get_capabilities(instance_name).await
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let content = TestData::from_static(b"foobar");
        let inner = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        inner
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();
        let storage = RetryingAccess::new(
            FlakyAccess {
                inner,
                failures: 2,
                seen: AtomicUsize::new(0),
            },
            policy(),
        );

        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn lazy_reads_retry_on_consumption() {
        let content = TestData::from_static(b"foobar");
        let inner = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        inner
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();
        let storage = RetryingAccess::new(
            FlakyAccess {
                inner,
                failures: 2,
                seen: AtomicUsize::new(0),
            },
            policy(),
        );

        let data = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content.bytes);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let content = TestData::from_static(b"foobar");
        let storage = RetryingAccess::new(
            FlakyAccess {
                inner: MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
                failures: usize::MAX,
                seen: AtomicUsize::new(0),
            },
            policy(),
        );

        let err = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "{err:?}");

        let err = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn permanent_errors_pass_through() {
        let content = TestData::from_static(b"foobar");
        let counted = Arc::new(AtomicUsize::new(0));

        struct DenyingAccess(Arc<AtomicUsize>);

        #[async_trait]
        impl BlobAccess for DenyingAccess {
            fn get(&self, _digest: &Digest) -> Buffer {
                Buffer::from_error(StorageError::PermissionDenied("no".to_owned()))
            }

            async fn put(&self, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
                buffer.discard();
                Err(StorageError::PermissionDenied("no".to_owned()))
            }

            async fn find_missing(&self, _digests: DigestSet) -> Result<DigestSet, StorageError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::PermissionDenied("no".to_owned()))
            }

            async fn get_capabilities(
                &self,
                _instance_name: &InstanceName,
            ) -> Result<Capabilities, StorageError> {
                Ok(Capabilities::default_cas())
            }
        }

        let storage = RetryingAccess::new(DenyingAccess(counted.clone()), policy());
        let err = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)), "{err:?}");
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }
}
