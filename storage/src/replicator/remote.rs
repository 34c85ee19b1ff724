// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use digest::DigestSet;
use protos::casgrid::replication::ReplicateBlobsRequest;
use tonic::Status;

use crate::error::StorageError;
use crate::replicator::Replicator;

/// Transport boundary for the replication RPC. The production implementation
/// wraps a gRPC channel to a dedicated replication service, which is itself a
/// storage front-end running one of the local engines.
#[async_trait]
pub trait ReplicationClient: Send + Sync + 'static {
    async fn replicate_blobs(&self, request: ReplicateBlobsRequest) -> Result<(), Status>;
}

/// Forwards replication requests to a remote replication service. Requests
/// are grouped per instance name and digest function, matching the shape of
/// the wire protocol.
pub struct RemoteReplicator<C> {
    client: C,
}

impl<C> RemoteReplicator<C>
where
    C: ReplicationClient,
{
    pub fn new(client: C) -> Self {
        RemoteReplicator { client }
    }
}

#[async_trait]
impl<C> Replicator for RemoteReplicator<C>
where
    C: ReplicationClient,
{
    async fn replicate(&self, digests: DigestSet) -> Result<(), StorageError> {
        let groups =
            digests.partition_by(|d| (d.instance_name().clone(), d.digest_function()));
        for ((instance_name, digest_function), group) in groups {
            let request = ReplicateBlobsRequest {
                instance_name: instance_name.to_string(),
                digest_function: digest_function.to_proto() as i32,
                blob_digests: group.iter().map(|d| d.to_proto()).collect(),
            };
            self.client
                .replicate_blobs(request)
                .await
                .map_err(StorageError::from)?;
        }
        Ok(())
    }
}
