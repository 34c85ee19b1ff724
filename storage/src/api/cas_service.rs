// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use digest::Digest;
use futures::future;
use protos::build::bazel::remote::execution::v2::{
    batch_read_blobs_response, batch_update_blobs_response, compressor, BatchReadBlobsRequest,
    BatchReadBlobsResponse, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse,
    Digest as ApiDigest, FindMissingBlobsRequest, FindMissingBlobsResponse, GetTreeRequest,
};
use tonic::{Request, Response, Status};

use crate::api::{convert_digest, convert_digests, parse_instance_name, InnerServer};
use crate::buffer::Buffer;
use crate::error::StorageError;

fn ok_status() -> protos::google::rpc::Status {
    protos::google::rpc::Status {
        code: protos::google::rpc::Code::Ok as i32,
        message: String::new(),
    }
}

pub struct CasService {
    pub(super) inner: Arc<InnerServer>,
}

impl CasService {
    /// Read one blob for `batch_read_blobs`, mapping failures into the
    /// per-item status rather than an RPC error.
    async fn read_blob(
        &self,
        digest_result: Result<Digest, String>,
        api_digest: ApiDigest,
    ) -> batch_read_blobs_response::Response {
        fn make_response(
            digest: ApiDigest,
            data: bytes::Bytes,
            status: protos::google::rpc::Status,
        ) -> batch_read_blobs_response::Response {
            batch_read_blobs_response::Response {
                digest: Some(digest),
                data,
                status: Some(status),
                compressor: compressor::Value::Identity as i32,
            }
        }

        let digest = match digest_result {
            Ok(digest) => digest,
            Err(err) => {
                return make_response(
                    api_digest,
                    bytes::Bytes::new(),
                    StorageError::InvalidArgument(err).into(),
                )
            }
        };

        match self
            .inner
            .cas
            .get(&digest)
            .into_bytes(self.inner.max_batch_total_size_bytes)
            .await
        {
            Ok(data) => make_response(api_digest, data, ok_status()),
            Err(err) => make_response(api_digest, bytes::Bytes::new(), err.into()),
        }
    }

    /// Write one blob for `batch_update_blobs`.
    async fn write_blob(
        &self,
        request: protos::build::bazel::remote::execution::v2::batch_update_blobs_request::Request,
        digest_result: Result<Digest, String>,
    ) -> batch_update_blobs_response::Response {
        fn make_response(
            digest: Option<ApiDigest>,
            status: protos::google::rpc::Status,
        ) -> batch_update_blobs_response::Response {
            batch_update_blobs_response::Response {
                digest,
                status: Some(status),
            }
        }

        if request.compressor != compressor::Value::Identity as i32 {
            return make_response(
                request.digest,
                StorageError::Unimplemented("Compressed batch payloads are not supported".into())
                    .into(),
            );
        }

        let digest = match digest_result {
            Ok(digest) => digest,
            Err(err) => {
                return make_response(
                    request.digest,
                    StorageError::InvalidArgument(err).into(),
                )
            }
        };

        let buffer = Buffer::from_user_bytes(digest.clone(), request.data);
        match self.inner.cas.put(digest, buffer).await {
            Ok(()) => make_response(request.digest, ok_status()),
            Err(err) => make_response(request.digest, err.into()),
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn find_missing_blobs(
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
                .cas
                .find_missing(digests)
                .await
                .map_err(Status::from)?
        };

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing_digests.iter().map(|d| d.to_proto()).collect(),
        }))
    }

    #[tracing::instrument(skip_all)]
    pub async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;

        let total_size: usize = request.requests.iter().map(|r| r.data.len()).sum();
        if total_size > self.inner.max_batch_total_size_bytes {
            return Err(Status::resource_exhausted(format!(
                "Batch of {total_size} bytes exceeds the maximum of {} bytes",
                self.inner.max_batch_total_size_bytes
            )));
        }

        let writes: Vec<_> = request
            .requests
            .into_iter()
            .map(|item| {
                let digest_result = match &item.digest {
                    Some(api_digest) => {
                        convert_digest(&instance_name, request.digest_function, api_digest)
                    }
                    None => Err("Missing digest".to_owned()),
                };
                self.write_blob(item, digest_result)
            })
            .collect();
        let responses = future::join_all(writes).await;

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    #[tracing::instrument(skip_all)]
    pub async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;

        let total_size: i64 = request.digests.iter().map(|d| d.size_bytes.max(0)).sum();
        if total_size as usize > self.inner.max_batch_total_size_bytes {
            return Err(Status::resource_exhausted(format!(
                "Batch of {total_size} bytes exceeds the maximum of {} bytes",
                self.inner.max_batch_total_size_bytes
            )));
        }

        let reads: Vec<_> = request
            .digests
            .into_iter()
            .map(|api_digest| {
                let digest_result =
                    convert_digest(&instance_name, request.digest_function, &api_digest);
                self.read_blob(digest_result, api_digest)
            })
            .collect();
        let responses = future::join_all(reads).await;

        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }

    #[tracing::instrument(skip_all)]
    pub async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<()>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        Err(Status::unimplemented("GetTree is not served here"))
    }
}
