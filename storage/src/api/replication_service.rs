// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use digest::DigestSet;
use protos::casgrid::replication::{ReplicateBlobsRequest, ReplicateBlobsResponse};
use tonic::{Request, Response, Status};

use crate::api::{convert_digests, parse_instance_name, InnerServer};
use crate::replicator::Replicator;

/// Server side of the replication protocol. Requests are validated, split
/// into bounded batches and driven through the configured replicator, which
/// is typically a deduplicating engine so that concurrent requests for the
/// same digests coalesce. The RPC completes only when the last digest is
/// durably written to the sink.
pub struct ReplicationService {
    pub(super) inner: Arc<InnerServer>,
    pub(super) replicator: Arc<dyn Replicator>,
    pub(super) max_batch_size: usize,
}

impl ReplicationService {
    #[tracing::instrument(skip_all)]
    pub async fn replicate_blobs(
        &self,
        request: Request<ReplicateBlobsRequest>,
    ) -> Result<Response<ReplicateBlobsResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;
        let digests = convert_digests(
            &instance_name,
            request.digest_function,
            &request.blob_digests,
        )?;

        let mut batch: Vec<digest::Digest> = Vec::with_capacity(self.max_batch_size);
        for digest in digests {
            batch.push(digest);
            if batch.len() >= self.max_batch_size {
                let full: DigestSet = std::mem::take(&mut batch).into_iter().collect();
                self.replicator
                    .replicate(full)
                    .await
                    .map_err(Status::from)?;
            }
        }
        if !batch.is_empty() {
            let rest: DigestSet = batch.into_iter().collect();
            self.replicator
                .replicate(rest)
                .await
                .map_err(Status::from)?;
        }

        Ok(Response::new(ReplicateBlobsResponse {}))
    }
}
