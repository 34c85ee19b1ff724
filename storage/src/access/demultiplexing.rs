// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName, InstanceNameTrie};
use futures::future;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// One route in a demultiplexer: traffic whose instance name falls under
/// `prefix` goes to `backend`, optionally with the matched prefix rewritten
/// to `instance_name_patcher` before the call reaches the backend.
pub struct DemultiplexedBackend {
    pub prefix: InstanceName,
    pub backend: Arc<dyn BlobAccess>,
    pub instance_name_patcher: Option<InstanceName>,
}

/// Routes every operation by the longest matching instance-name prefix.
/// Operations whose inputs span multiple routes (`find_missing` over a mixed
/// digest set) are partitioned, fanned out in parallel and merged; the first
/// failing route fails the whole call and cancels its siblings.
pub struct DemultiplexingAccess {
    routes: InstanceNameTrie,
    backends: Vec<DemultiplexedBackend>,
}

impl DemultiplexingAccess {
    pub fn new(backends: Vec<DemultiplexedBackend>) -> Self {
        let mut routes = InstanceNameTrie::new();
        for (index, backend) in backends.iter().enumerate() {
            routes.set(&backend.prefix, index);
        }
        DemultiplexingAccess { routes, backends }
    }

    fn backend_index_for(&self, instance_name: &InstanceName) -> Result<usize, StorageError> {
        self.routes.lookup_longest(instance_name).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "Unknown instance name {:?}",
                instance_name.as_str()
            ))
        })
    }

    /// Rewrite the matched route prefix on the way into a backend.
    fn patch_digest(&self, index: usize, digest: &Digest) -> Digest {
        let route = &self.backends[index];
        match &route.instance_name_patcher {
            Some(new_prefix) => {
                let patched = digest
                    .instance_name()
                    .with_prefix_replaced(&route.prefix, new_prefix)
                    .expect("instance name routed by prefix");
                digest.with_instance_name(patched)
            }
            None => digest.clone(),
        }
    }

    /// Undo `patch_digest` on results coming back from a backend.
    fn unpatch_digest(&self, index: usize, digest: &Digest) -> Digest {
        let route = &self.backends[index];
        match &route.instance_name_patcher {
            Some(new_prefix) => {
                let restored = digest
                    .instance_name()
                    .with_prefix_replaced(new_prefix, &route.prefix)
                    .expect("backend preserved the patched prefix");
                digest.with_instance_name(restored)
            }
            None => digest.clone(),
        }
    }
}

#[async_trait]
impl BlobAccess for DemultiplexingAccess {
    fn get(&self, digest: &Digest) -> Buffer {
        match self.backend_index_for(digest.instance_name()) {
            Ok(index) => self.backends[index]
                .backend
                .get(&self.patch_digest(index, digest)),
            Err(err) => Buffer::from_error(err),
        }
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let index = match self.backend_index_for(digest.instance_name()) {
            Ok(index) => index,
            Err(err) => {
                buffer.discard();
                return Err(err);
            }
        };
        let patched = self.patch_digest(index, &digest);
        self.backends[index].backend.put(patched, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        if digests.is_empty() {
            return Ok(DigestSet::new());
        }
        let partitions =
            digests.try_partition_by(|d| self.backend_index_for(d.instance_name()))?;

        let queries = partitions.into_iter().map(|(index, digests)| async move {
            let patched = digests.map(|d| self.patch_digest(index, d));
            let missing = self.backends[index].backend.find_missing(patched).await?;
            Ok::<_, StorageError>(missing.map(|d| self.unpatch_digest(index, d)))
        });

        // try_join_all drops the remaining queries as soon as one fails.
        let results = future::try_join_all(queries).await?;
        Ok(results
            .into_iter()
            .fold(DigestSet::new(), |acc, missing| acc.union(missing)))
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let index = self.backend_index_for(instance_name)?;
        let route = &self.backends[index];
        let patched = match &route.instance_name_patcher {
            Some(new_prefix) => instance_name
                .with_prefix_replaced(&route.prefix, new_prefix)
                .expect("instance name routed by prefix"),
            None => instance_name.clone(),
        };
        route.backend.get_capabilities(&patched).await
    }
}
