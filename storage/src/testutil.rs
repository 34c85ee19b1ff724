// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::{Digest, DigestFunction, DigestSet, InstanceName};

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// Container for digest/bytes of test content.
#[derive(Clone, Debug)]
pub struct TestData {
    /// The actual bytes of the content.
    pub bytes: Bytes,

    /// Digest of the content.
    pub digest: Digest,
}

impl TestData {
    pub fn from_static(content: &'static [u8]) -> Self {
        Self::with_function(DigestFunction::Sha256, content)
    }

    pub fn with_function(function: DigestFunction, content: &'static [u8]) -> Self {
        let bytes = Bytes::from_static(content);
        let digest = Digest::of_bytes(
            InstanceName::new("main").expect("valid instance name"),
            function,
            &bytes,
        );
        Self { bytes, digest }
    }

    pub fn with_instance(instance: &str, content: &'static [u8]) -> Self {
        let bytes = Bytes::from_static(content);
        let digest = Digest::of_bytes(
            InstanceName::new(instance).expect("valid instance name"),
            DigestFunction::Sha256,
            &bytes,
        );
        Self { bytes, digest }
    }

    pub fn user_buffer(&self) -> Buffer {
        Buffer::from_user_bytes(self.digest.clone(), self.bytes.clone())
    }

    pub fn validated_buffer(&self) -> Buffer {
        Buffer::from_validated_bytes(self.bytes.clone())
    }
}

/// Counts calls into an underlying access, so tests can assert which layers
/// were consulted.
#[derive(Clone)]
pub struct CountingAccess<BA> {
    inner: BA,
    pub get_count: Arc<AtomicUsize>,
    pub put_count: Arc<AtomicUsize>,
    pub find_missing_count: Arc<AtomicUsize>,
}

impl<BA> CountingAccess<BA> {
    pub fn new(inner: BA) -> Self {
        Self {
            inner,
            get_count: Arc::new(AtomicUsize::new(0)),
            put_count: Arc::new(AtomicUsize::new(0)),
            find_missing_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// (find_missing, get, put) call counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.find_missing_count.load(Ordering::SeqCst),
            self.get_count.load(Ordering::SeqCst),
            self.put_count.load(Ordering::SeqCst),
        )
    }

    pub fn get_ref(&self) -> &BA {
        &self.inner
    }
}

#[async_trait]
impl<BA> BlobAccess for CountingAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.inner.get(digest)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.inner.put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.find_missing_count.fetch_add(1, Ordering::SeqCst);
        self.inner.find_missing(digests).await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.inner.get_capabilities(instance_name).await
    }
}

/// An access whose every operation fails with a configured error.
#[derive(Clone)]
pub struct FailingAccess {
    error: StorageError,
}

impl FailingAccess {
    pub fn new(error: StorageError) -> Self {
        Self { error }
    }

    pub fn unavailable() -> Self {
        Self::new(StorageError::Unavailable("backend is down".to_owned()))
    }
}

#[async_trait]
impl BlobAccess for FailingAccess {
    fn get(&self, _digest: &Digest) -> Buffer {
        Buffer::from_error(self.error.clone())
    }

    async fn put(&self, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Err(self.error.clone())
    }

    async fn find_missing(&self, _digests: DigestSet) -> Result<DigestSet, StorageError> {
        Err(self.error.clone())
    }

    async fn get_capabilities(
        &self,
        _instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        Err(self.error.clone())
    }
}

/// An access that claims to hold everything, but cannot actually serve reads.
pub struct AlwaysExistsAccess;

#[async_trait]
impl BlobAccess for AlwaysExistsAccess {
    fn get(&self, _digest: &Digest) -> Buffer {
        Buffer::from_error(StorageError::Unavailable(
            "This access claims that all values exist, but doesn't actually contain anything."
                .to_owned(),
        ))
    }

    async fn put(&self, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Ok(())
    }

    async fn find_missing(&self, _digests: DigestSet) -> Result<DigestSet, StorageError> {
        Ok(DigestSet::new())
    }

    async fn get_capabilities(
        &self,
        _instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        Ok(Capabilities::default_cas())
    }
}
