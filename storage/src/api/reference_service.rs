// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use futures::future;
use protos::build::bazel::remote::execution::v2::{
    FindMissingBlobsRequest, FindMissingBlobsResponse,
};
use protos::casgrid::icas::{
    batch_update_references_response, BatchUpdateReferencesRequest,
    BatchUpdateReferencesResponse, GetReferenceRequest, GetReferenceResponse, Reference,
};
use tonic::{Request, Response, Status};

use crate::api::{convert_digest, convert_digests, parse_instance_name, InnerServer};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// The Indirect CAS: stores small references describing where blob contents
/// can be fetched from, keyed by the digest of those contents. Runs on the
/// same engine as the CAS with a different payload type.
pub struct ReferenceService {
    pub(super) inner: Arc<InnerServer>,
}

impl ReferenceService {
    #[tracing::instrument(skip_all)]
    pub async fn find_missing_references(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;
        let digests = convert_digests(
            &instance_name,
            request.digest_function,
            &request.blob_digests,
        )?;

        let missing_digests = if digests.is_empty() {
            digests
        } else {
            self.inner
                .indirect_cas
                .find_missing(digests)
                .await
                .map_err(Status::from)?
        };

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing_digests.iter().map(|d| d.to_proto()).collect(),
        }))
    }

    #[tracing::instrument(skip_all)]
    pub async fn batch_update_references(
        &self,
        request: Request<BatchUpdateReferencesRequest>,
    ) -> Result<Response<BatchUpdateReferencesResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;

        let writes = request.requests.into_iter().map(|item| {
            let instance_name = &instance_name;
            async move {
                let status: protos::google::rpc::Status = match (&item.digest, item.reference) {
                    (Some(api_digest), Some(reference)) => {
                        match convert_digest(instance_name, request.digest_function, api_digest) {
                            Ok(digest) => match self
                                .inner
                                .indirect_cas
                                .put(digest, Buffer::from_proto(reference))
                                .await
                            {
                                Ok(()) => protos::google::rpc::Status {
                                    code: protos::google::rpc::Code::Ok as i32,
                                    message: String::new(),
                                },
                                Err(err) => err.into(),
                            },
                            Err(err) => StorageError::InvalidArgument(err).into(),
                        }
                    }
                    (None, _) => {
                        StorageError::InvalidArgument("Missing digest".to_owned()).into()
                    }
                    (_, None) => {
                        StorageError::InvalidArgument("Missing reference".to_owned()).into()
                    }
                };
                batch_update_references_response::Response {
                    digest: item.digest,
                    status: Some(status),
                }
            }
        });
        let responses = future::join_all(writes).await;

        Ok(Response::new(BatchUpdateReferencesResponse { responses }))
    }

    #[tracing::instrument(skip_all)]
    pub async fn get_reference(
        &self,
        request: Request<GetReferenceRequest>,
    ) -> Result<Response<GetReferenceResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;
        let blob_digest = request
            .blob_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Missing blob_digest"))?;
        let digest = convert_digest(&instance_name, request.digest_function, blob_digest)
            .map_err(Status::invalid_argument)?;

        let reference: Reference = self
            .inner
            .indirect_cas
            .get(&digest)
            .into_proto(self.inner.max_batch_total_size_bytes)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetReferenceResponse {
            reference: Some(reference),
        }))
    }
}
