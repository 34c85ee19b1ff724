// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::{Compressor, Digest, DigestFunction, DigestSet, InstanceName};

use crate::buffer::Buffer;
use crate::error::StorageError;

mod deadline;
mod demultiplexing;
mod existence_cache;
mod memory;
mod metrics;
mod mirrored;
mod read_caching;
mod retrying;
mod sharding;
mod size_split;
mod update_gate;

pub use deadline::DeadlineEnforcingAccess;
pub use demultiplexing::{DemultiplexedBackend, DemultiplexingAccess};
pub use existence_cache::{EvictionPolicy, ExistenceCachingAccess};
pub use memory::MemoryAccess;
pub use metrics::MetricsMonitoredAccess;
pub use mirrored::{MirroredAccess, ReadPolicy};
pub use read_caching::ReadCachingAccess;
pub use retrying::{RetryPolicy, RetryingAccess};
pub use sharding::{Shard, ShardingAccess};
pub use size_split::SizeSplitAccess;
pub use update_gate::UpdateGatingAccess;

/// Per-instance capabilities reported by a storage tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub digest_functions: Vec<DigestFunction>,
    pub max_batch_total_size_bytes: Option<usize>,
    pub supported_compressors: Vec<Compressor>,
    pub update_enabled: bool,
}

impl Capabilities {
    /// Capabilities of a plain content-addressed backend: every digest
    /// function this workspace can verify, no compression, no updates.
    pub fn default_cas() -> Self {
        Capabilities {
            digest_functions: DigestFunction::ALL.to_vec(),
            max_batch_total_size_bytes: None,
            supported_compressors: Vec::new(),
            update_enabled: false,
        }
    }

    /// Merge the capabilities of two backends that both serve an instance.
    /// Only what both sides support remains; updates require both sides to
    /// accept them.
    pub fn merge(self, other: Capabilities) -> Capabilities {
        Capabilities {
            digest_functions: self
                .digest_functions
                .into_iter()
                .filter(|f| other.digest_functions.contains(f))
                .collect(),
            max_batch_total_size_bytes: match (
                self.max_batch_total_size_bytes,
                other.max_batch_total_size_bytes,
            ) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            supported_compressors: self
                .supported_compressors
                .into_iter()
                .filter(|c| other.supported_compressors.contains(c))
                .collect(),
            update_enabled: self.update_enabled && other.update_enabled,
        }
    }
}

/// Interprets a parent object so that a child blob stored inside it can be
/// served as a slice, without the backend holding the child separately.
pub trait BlobSlicer: Send + Sync + 'static {
    fn slice(&self, parent: Buffer, child: &Digest) -> Buffer;
}

/// The uniform storage-engine contract. Every decorator and composition
/// layer implements this same trait, so storage trees compose freely.
#[async_trait]
pub trait BlobAccess: Send + Sync + 'static {
    /// Return a lazy buffer for `digest`. This never blocks on I/O: reads
    /// happen when the buffer is consumed.
    fn get(&self, digest: &Digest) -> Buffer;

    /// Like `get`, but the backend may serve `child` as a slice of `parent`
    /// with the help of `slicer`.
    fn get_from_composite(
        &self,
        parent: &Digest,
        child: &Digest,
        slicer: Arc<dyn BlobSlicer>,
    ) -> Buffer {
        slicer.slice(self.get(parent), child)
    }

    /// Store `buffer` under `digest`, taking ownership of the buffer and
    /// consuming it exactly once. User-provided buffers are verified against
    /// `digest` during consumption.
    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError>;

    /// Return the subset of `digests` this backend cannot serve. An empty
    /// input yields an empty output without any backend traffic. Being
    /// conservative (reporting extra digests as missing) is permitted;
    /// claiming presence it cannot back up is not.
    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError>;

    /// Merged capabilities for an instance.
    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError>;
}

impl std::fmt::Debug for dyn BlobAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BlobAccess")
    }
}

#[async_trait]
impl<BA> BlobAccess for Arc<BA>
where
    BA: BlobAccess + ?Sized,
{
    fn get(&self, digest: &Digest) -> Buffer {
        (**self).get(digest)
    }

    fn get_from_composite(
        &self,
        parent: &Digest,
        child: &Digest,
        slicer: Arc<dyn BlobSlicer>,
    ) -> Buffer {
        (**self).get_from_composite(parent, child, slicer)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        (**self).put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        (**self).find_missing(digests).await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        (**self).get_capabilities(instance_name).await
    }
}

#[async_trait]
impl<BA> BlobAccess for Box<BA>
where
    BA: BlobAccess + ?Sized,
{
    fn get(&self, digest: &Digest) -> Buffer {
        (**self).get(digest)
    }

    fn get_from_composite(
        &self,
        parent: &Digest,
        child: &Digest,
        slicer: Arc<dyn BlobSlicer>,
    ) -> Buffer {
        (**self).get_from_composite(parent, child, slicer)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        (**self).put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        (**self).find_missing(digests).await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        (**self).get_capabilities(instance_name).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use digest::{Digest, DigestFunction, InstanceName, KeyFormat};

    use super::{BlobAccess, BlobSlicer, Capabilities, MemoryAccess};
    use crate::buffer::Buffer;
    use crate::testutil::TestData;

    /// Serves a child blob as a byte range of its parent.
    struct RangeSlicer {
        offset: usize,
    }

    impl BlobSlicer for RangeSlicer {
        fn slice(&self, parent: Buffer, child: &Digest) -> Buffer {
            let offset = self.offset;
            let child = child.clone();
            Buffer::from_future(
                child.clone(),
                Box::pin(async move {
                    let parent_data = match parent.into_bytes(usize::MAX).await {
                        Ok(data) => data,
                        Err(err) => return Buffer::from_error(err),
                    };
                    let end = offset + child.size_bytes();
                    Buffer::from_user_bytes(child, parent_data.slice(offset..end))
                }),
            )
        }
    }

    #[tokio::test]
    async fn composite_gets_slice_the_parent() {
        let storage = MemoryAccess::content_addressed(KeyFormat::WithoutInstance);
        let parent = TestData::from_static(b"LaputanMachine");
        storage
            .put(parent.digest.clone(), parent.user_buffer())
            .await
            .unwrap();

        let child = Digest::of_bytes(
            InstanceName::new("main").unwrap(),
            DigestFunction::Sha256,
            b"Machine",
        );
        let data = storage
            .get_from_composite(&parent.digest, &child, Arc::new(RangeSlicer { offset: 7 }))
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, bytes::Bytes::from_static(b"Machine"));
    }

    #[test]
    fn capabilities_merge_is_an_intersection() {
        let everything = Capabilities {
            digest_functions: DigestFunction::ALL.to_vec(),
            max_batch_total_size_bytes: Some(4096),
            supported_compressors: Vec::new(),
            update_enabled: true,
        };
        let restricted = Capabilities {
            digest_functions: vec![DigestFunction::Sha256],
            max_batch_total_size_bytes: Some(1024),
            supported_compressors: Vec::new(),
            update_enabled: false,
        };

        let merged = everything.merge(restricted);
        assert_eq!(merged.digest_functions, vec![DigestFunction::Sha256]);
        assert_eq!(merged.max_batch_total_size_bytes, Some(1024));
        assert!(!merged.update_enabled);
    }
}
