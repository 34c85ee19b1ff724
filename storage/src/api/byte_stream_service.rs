// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use digest::{
    parse_read_resource_name, parse_write_resource_name, Compressor, ResourceError,
};
use futures::{Stream, StreamExt};
use protos::google::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use tonic::{Request, Response, Status};

use crate::access::BlobAccess;
use crate::buffer::{Buffer, BufferSource, ChunkStream};
use crate::error::StorageError;

use crate::api::InnerServer;

/// Preferred chunk size for streaming reads.
const READ_CHUNK_SIZE: usize = 16 * 1024;

pub type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send + 'static>>;

fn resource_error_to_status(err: ResourceError) -> Status {
    match err {
        ResourceError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        ResourceError::Unimplemented(_) => Status::unimplemented(err.to_string()),
    }
}

/// Truncate a chunk stream after `limit` bytes.
fn limit_stream(mut stream: ChunkStream, limit: usize) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut remaining = limit;
        while remaining > 0 {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let chunk = if chunk.len() > remaining {
                        chunk.slice(0..remaining)
                    } else {
                        chunk
                    };
                    remaining -= chunk.len();
                    yield Ok(chunk);
                }
                Some(Err(err)) => {
                    yield Err(err);
                    return;
                }
                None => return,
            }
        }
    })
}

pub struct ByteStreamService {
    pub(super) inner: Arc<InnerServer>,
}

impl ByteStreamService {
    #[tracing::instrument(skip_all)]
    pub async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadStream>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();

        let resource =
            parse_read_resource_name(&request.resource_name).map_err(resource_error_to_status)?;
        if resource.compressor != Compressor::Identity {
            return Err(Status::unimplemented(
                "Compressed reads are not supported",
            ));
        }
        let digest = resource.digest;

        let read_offset = match request.read_offset {
            x if x < 0 => return Err(Status::out_of_range("negative read_offset")),
            x if x as usize > digest.size_bytes() => {
                return Err(Status::out_of_range(format!(
                    "read_offset {x} exceeds size of resource ({} bytes)",
                    digest.size_bytes()
                )))
            }
            x => x as usize,
        };
        let read_limit = match request.read_limit {
            x if x < 0 => return Err(Status::out_of_range("negative read_limit")),
            0 => None,
            x => Some(x as usize),
        };

        let mut stream = self
            .inner
            .cas
            .get(&digest)
            .into_chunk_stream(read_offset, READ_CHUNK_SIZE);
        if let Some(limit) = read_limit {
            stream = limit_stream(stream, limit);
        }

        let response_stream: ReadStream = Box::pin(
            stream.map(|chunk| chunk.map(|data| ReadResponse { data }).map_err(Status::from)),
        );
        Ok(Response::new(response_stream))
    }

    #[tracing::instrument(skip_all)]
    pub async fn write<S>(&self, request: Request<S>) -> Result<Response<WriteResponse>, Status>
    where
        S: Stream<Item = Result<WriteRequest, Status>> + Send + Unpin + 'static,
    {
        self.inner.check_authenticated(request.metadata()).await?;
        let mut stream = request.into_inner();

        // The first message must carry the resource name to write to.
        let first_msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => return Err(err),
            None => return Err(Status::cancelled("client disconnected")),
        };

        let resource = parse_write_resource_name(&first_msg.resource_name)
            .map_err(resource_error_to_status)?;
        if resource.compressor != Compressor::Identity {
            return Err(Status::unimplemented(
                "Compressed writes are not supported",
            ));
        }
        let digest = resource.digest;

        // Adapt the request stream into the content chunks of one upload,
        // enforcing offset continuity and the finish_write contract. The
        // buffer layer verifies size and digest as the chunks stream
        // through.
        let content_stream: ChunkStream = Box::pin(async_stream::stream! {
            let mut committed: usize = 0;
            let mut next_msg = Some(first_msg);
            while let Some(msg) = next_msg.take() {
                if msg.write_offset != committed as i64 {
                    yield Err(StorageError::OutOfRange(
                        "write_offset (vs committed size)".to_owned(),
                        msg.write_offset.max(0) as usize,
                    ));
                    return;
                }
                committed += msg.data.len();
                if !msg.data.is_empty() {
                    yield Ok::<Bytes, StorageError>(msg.data);
                }
                if msg.finish_write {
                    return;
                }
                next_msg = match stream.next().await {
                    Some(Ok(msg)) => Some(msg),
                    Some(Err(status)) => {
                        yield Err(StorageError::Cancelled(format!(
                            "client stream error: {status}"
                        )));
                        return;
                    }
                    None => {
                        yield Err(StorageError::Cancelled(
                            "write stream closed without specifying finish_write".to_owned(),
                        ));
                        return;
                    }
                };
            }
        });

        let buffer =
            Buffer::from_chunk_stream(digest.clone(), BufferSource::UserProvided, content_stream);
        self.inner
            .cas
            .put(digest.clone(), buffer)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(WriteResponse {
            committed_size: digest.size_bytes() as i64,
        }))
    }

    /// Resumable writes are not supported.
    #[tracing::instrument(skip_all)]
    pub async fn query_write_status(
        &self,
        _request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        Err(Status::unimplemented("Not supported"))
    }
}
