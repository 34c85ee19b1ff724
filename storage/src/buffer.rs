// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A single-consumer byte container carrying the digest its contents are
//! expected to match. Buffers are created by storage backends at retrieval
//! time and consumed exactly once; ownership transfers on every hop through
//! the decorator chain, so the type is move-only and each consumer method
//! takes `self`.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use digest::Digest;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{Stream, StreamExt};
use prost::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::StorageError;

/// Alias for the type of a chunked read stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send + 'static>>;

type SharedBytesFuture = Shared<BoxFuture<'static, Result<Bytes, StorageError>>>;

/// Invoked with the outcome of integrity verification of backend-provided
/// contents, so that the backend may repair or evict corrupted entries.
pub type IntegrityObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// The provenance of a buffer's contents, which decides whether integrity
/// must be verified when the buffer is consumed and whether a mismatch is the
/// caller's fault or corruption inside the data store.
#[derive(Clone)]
pub enum BufferSource {
    /// Contents already known to match the digest (e.g. well-known constants
    /// or data validated earlier in the chain).
    Validated,
    /// Untrusted contents supplied by a client; verified on consumption and
    /// mismatches reported as `invalid argument`.
    UserProvided,
    /// Contents read back from a storage backend; verified on consumption,
    /// mismatches reported as `data loss`, and the observer notified of the
    /// outcome.
    BackendProvided(IntegrityObserver),
}

impl BufferSource {
    fn requires_verification(&self) -> bool {
        !matches!(self, BufferSource::Validated)
    }

    fn is_data_loss(&self) -> bool {
        matches!(self, BufferSource::BackendProvided(_))
    }

    fn observe(&self, ok: bool) {
        if let BufferSource::BackendProvided(observer) = self {
            observer(ok);
        }
    }
}

/// Translates terminal errors observed while a buffer is being consumed,
/// e.g. to substitute a fallback buffer read from another backend. `done` is
/// called on the successful completion path as well, which is the hook the
/// deadline layer uses to release its timer.
pub trait ErrorHandler: Send + 'static {
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError>;

    fn done(self: Box<Self>) {}
}

enum Inner {
    Slice {
        digest: Option<Digest>,
        data: Bytes,
        source: BufferSource,
    },
    Proto {
        size: usize,
        encode: Box<dyn FnOnce() -> Bytes + Send + 'static>,
    },
    Stream {
        digest: Digest,
        stream: ChunkStream,
        source: BufferSource,
    },
    Reopening {
        digest: Digest,
        open: Arc<dyn Fn() -> ChunkStream + Send + Sync + 'static>,
        source: BufferSource,
    },
    Deferred {
        size: usize,
        data: SharedBytesFuture,
    },
    Future {
        digest: Digest,
        future: BoxFuture<'static, Buffer>,
    },
    Error {
        error: StorageError,
    },
    WithErrorHandler {
        buffer: Box<Buffer>,
        handler: Box<dyn ErrorHandler>,
    },
}

pub struct Buffer {
    inner: Inner,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match &self.inner {
            Inner::Slice { .. } => "Slice",
            Inner::Proto { .. } => "Proto",
            Inner::Stream { .. } => "Stream",
            Inner::Reopening { .. } => "Reopening",
            Inner::Deferred { .. } => "Deferred",
            Inner::Future { .. } => "Future",
            Inner::Error { .. } => "Error",
            Inner::WithErrorHandler { .. } => "WithErrorHandler",
        };
        f.debug_struct("Buffer").field("inner", &variant).finish()
    }
}

impl Buffer {
    /// A buffer whose contents are already trusted to be correct.
    pub fn from_validated_bytes(data: Bytes) -> Buffer {
        Buffer {
            inner: Inner::Slice {
                digest: None,
                data,
                source: BufferSource::Validated,
            },
        }
    }

    /// Untrusted client-supplied contents; verified against `digest` when
    /// consumed.
    pub fn from_user_bytes(digest: Digest, data: Bytes) -> Buffer {
        Buffer {
            inner: Inner::Slice {
                digest: Some(digest),
                data,
                source: BufferSource::UserProvided,
            },
        }
    }

    /// Contents read back from a storage backend.
    pub fn from_backend_bytes(digest: Digest, data: Bytes, observer: IntegrityObserver) -> Buffer {
        Buffer {
            inner: Inner::Slice {
                digest: Some(digest),
                data,
                source: BufferSource::BackendProvided(observer),
            },
        }
    }

    /// A lazy buffer backed by a chunk stream. No I/O happens until the
    /// buffer is consumed.
    pub fn from_chunk_stream(digest: Digest, source: BufferSource, stream: ChunkStream) -> Buffer {
        Buffer {
            inner: Inner::Stream {
                digest,
                stream,
                source,
            },
        }
    }

    /// A lazy buffer whose producer can be reopened, permitting clones of any
    /// size to degrade to independent re-reads.
    pub fn from_reopening_stream(
        digest: Digest,
        source: BufferSource,
        open: Arc<dyn Fn() -> ChunkStream + Send + Sync + 'static>,
    ) -> Buffer {
        Buffer {
            inner: Inner::Reopening {
                digest,
                source,
                open,
            },
        }
    }

    /// A buffer holding a protobuf message, encoded on demand. Message
    /// payloads are not content-addressed, so no digest verification applies.
    pub fn from_proto<M: Message + 'static>(message: M) -> Buffer {
        let size = message.encoded_len();
        Buffer {
            inner: Inner::Proto {
                size,
                encode: Box::new(move || Bytes::from(message.encode_to_vec())),
            },
        }
    }

    /// A buffer produced asynchronously, e.g. after a network round trip or a
    /// repair performed by a replicator. The future is not polled until the
    /// buffer is consumed.
    pub fn from_future(digest: Digest, future: BoxFuture<'static, Buffer>) -> Buffer {
        Buffer {
            inner: Inner::Future { digest, future },
        }
    }

    /// A terminal failure, propagated by every consumer operation.
    pub fn from_error(error: StorageError) -> Buffer {
        Buffer {
            inner: Inner::Error { error },
        }
    }

    /// Attach an error handler that is consulted when consumption fails and
    /// released when consumption completes.
    pub fn with_error_handler(self, handler: Box<dyn ErrorHandler>) -> Buffer {
        Buffer {
            inner: Inner::WithErrorHandler {
                buffer: Box::new(self),
                handler,
            },
        }
    }

    /// The declared size of the contents in bytes.
    pub fn size_bytes(&self) -> Result<usize, StorageError> {
        match &self.inner {
            Inner::Slice {
                digest: Some(digest),
                ..
            } => Ok(digest.size_bytes()),
            Inner::Slice { data, .. } => Ok(data.len()),
            Inner::Proto { size, .. } => Ok(*size),
            Inner::Stream { digest, .. }
            | Inner::Reopening { digest, .. }
            | Inner::Future { digest, .. } => Ok(digest.size_bytes()),
            Inner::Deferred { size, .. } => Ok(*size),
            Inner::Error { error } => Err(error.clone()),
            Inner::WithErrorHandler { buffer, .. } => buffer.size_bytes(),
        }
    }

    /// Consume the buffer into a single `Bytes`, verifying integrity for
    /// untrusted provenance. Fails with `invalid argument` when the declared
    /// size exceeds `max_size`, before any I/O is performed.
    pub async fn into_bytes(self, max_size: usize) -> Result<Bytes, StorageError> {
        self.into_bytes_impl(max_size).await
    }

    fn into_bytes_impl(self, max_size: usize) -> BoxFuture<'static, Result<Bytes, StorageError>> {
        async move {
            if let Ok(size) = self.size_bytes() {
                if size > max_size {
                    return Err(StorageError::InvalidArgument(format!(
                        "Buffer is {size} bytes in size, while a maximum of {max_size} bytes is permitted"
                    )));
                }
            }
            match self.inner {
                Inner::Slice {
                    digest,
                    data,
                    source,
                } => {
                    if let Some(digest) = digest {
                        verify_bytes(&digest, &source, &data)?;
                    }
                    Ok(data)
                }
                Inner::Proto { encode, .. } => Ok(encode()),
                Inner::Stream {
                    digest,
                    stream,
                    source,
                } => consolidate_stream(apply_verification(digest, source, stream)).await,
                Inner::Reopening {
                    digest,
                    open,
                    source,
                } => consolidate_stream(apply_verification(digest, source, open())).await,
                Inner::Deferred { data, .. } => data.await,
                Inner::Future { future, .. } => future.await.into_bytes_impl(max_size).await,
                Inner::Error { error } => Err(error),
                Inner::WithErrorHandler { buffer, mut handler } => {
                    match buffer.into_bytes_impl(max_size).await {
                        Ok(data) => {
                            handler.done();
                            Ok(data)
                        }
                        Err(err) => match handler.on_error(err) {
                            Ok(replacement) => {
                                let result = replacement.into_bytes_impl(max_size).await;
                                handler.done();
                                result
                            }
                            Err(err) => {
                                handler.done();
                                Err(err)
                            }
                        },
                    }
                }
            }
        }
        .boxed()
    }

    /// Consume the buffer by decoding it as a protobuf message.
    pub async fn into_proto<M: Message + Default>(
        self,
        max_size: usize,
    ) -> Result<M, StorageError> {
        let data = self.into_bytes(max_size).await?;
        M::decode(data)
            .map_err(|err| StorageError::InvalidArgument(format!("Failed to decode message: {err}")))
    }

    /// Consume the buffer as a chunked stream starting at `offset`, emitting
    /// chunks of at most `chunk_size` bytes. The offset is served by
    /// discarding leading bytes, so producers never need to seek.
    pub fn into_chunk_stream(self, offset: usize, chunk_size: usize) -> ChunkStream {
        match self.size_bytes() {
            Ok(size) if offset > size => {
                return error_stream(StorageError::InvalidArgument(format!(
                    "Offset {offset} exceeds buffer size of {size} bytes"
                )));
            }
            _ => {}
        }
        rechunk_stream(skip_stream(self.into_verified_stream(), offset), chunk_size)
    }

    /// Consume the buffer by copying its contents into an async writer.
    pub async fn into_writer<W>(self, writer: &mut W) -> Result<(), StorageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut stream = self.into_verified_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| StorageError::Internal(format!("Write failed: {err}")))?;
        }
        Ok(())
    }

    /// Consume the buffer without reading it. Error handlers attached to the
    /// buffer are released.
    pub fn discard(self) {}

    /// Split the buffer into two independently consumable copies.
    ///
    /// Byte-backed and reopenable shapes clone structurally. A lazy stream is
    /// read once through a shared future as long as its declared size stays
    /// within `max_size`, bounding the memory pinned by the clone; beyond
    /// that the clone fails with `resource exhausted`.
    pub fn clone_copy(self, max_size: usize) -> Result<(Buffer, Buffer), StorageError> {
        match self.inner {
            Inner::Error { error } => Ok((
                Buffer::from_error(error.clone()),
                Buffer::from_error(error),
            )),
            Inner::Slice {
                digest,
                data,
                source,
            } => Ok((
                Buffer {
                    inner: Inner::Slice {
                        digest: digest.clone(),
                        data: data.clone(),
                        source: source.clone(),
                    },
                },
                Buffer {
                    inner: Inner::Slice {
                        digest,
                        data,
                        source,
                    },
                },
            )),
            Inner::Proto { encode, .. } => {
                let data = encode();
                Ok((
                    Buffer::from_validated_bytes(data.clone()),
                    Buffer::from_validated_bytes(data),
                ))
            }
            Inner::Reopening {
                digest,
                open,
                source,
            } => Ok((
                Buffer {
                    inner: Inner::Reopening {
                        digest: digest.clone(),
                        open: open.clone(),
                        source: source.clone(),
                    },
                },
                Buffer {
                    inner: Inner::Reopening {
                        digest,
                        open,
                        source,
                    },
                },
            )),
            Inner::Deferred { size, data } => Ok((
                Buffer {
                    inner: Inner::Deferred {
                        size,
                        data: data.clone(),
                    },
                },
                Buffer {
                    inner: Inner::Deferred { size, data },
                },
            )),
            inner @ (Inner::Stream { .. } | Inner::Future { .. } | Inner::WithErrorHandler { .. }) => {
                let buffer = Buffer { inner };
                let size = buffer.size_bytes()?;
                if size > max_size {
                    return Err(StorageError::ResourceExhausted(format!(
                        "Buffer of {size} bytes cannot be cloned, as it exceeds the maximum of {max_size} bytes"
                    )));
                }
                // Verification runs once inside the shared read; both halves
                // observe already-validated contents.
                let data = buffer.into_bytes_impl(size).shared();
                Ok((
                    Buffer {
                        inner: Inner::Deferred {
                            size,
                            data: data.clone(),
                        },
                    },
                    Buffer {
                        inner: Inner::Deferred { size, data },
                    },
                ))
            }
        }
    }

    /// The buffer's contents as a verified stream, with error handlers
    /// applied and provenance-appropriate integrity checking inline.
    fn into_verified_stream(self) -> ChunkStream {
        match self.inner {
            Inner::Slice {
                digest,
                data,
                source,
            } => Box::pin(async_stream::stream! {
                if let Some(digest) = digest {
                    if let Err(err) = verify_bytes(&digest, &source, &data) {
                        yield Err(err);
                        return;
                    }
                }
                if !data.is_empty() {
                    yield Ok(data);
                }
            }),
            Inner::Proto { encode, .. } => Box::pin(async_stream::stream! {
                let data = encode();
                if !data.is_empty() {
                    yield Ok::<Bytes, StorageError>(data);
                }
            }),
            Inner::Stream {
                digest,
                stream,
                source,
            } => apply_verification(digest, source, stream),
            Inner::Reopening {
                digest,
                open,
                source,
            } => apply_verification(digest, source, open()),
            Inner::Deferred { data, .. } => Box::pin(async_stream::stream! {
                match data.await {
                    Ok(data) => {
                        if !data.is_empty() {
                            yield Ok(data);
                        }
                    }
                    Err(err) => yield Err(err),
                }
            }),
            Inner::Future { future, .. } => Box::pin(async_stream::stream! {
                let mut stream = future.await.into_verified_stream();
                while let Some(chunk) = stream.next().await {
                    yield chunk;
                }
            }),
            Inner::Error { error } => error_stream(error),
            Inner::WithErrorHandler { buffer, handler } => {
                Box::pin(async_stream::stream! {
                    let mut handler_opt = Some(handler);
                    let mut delivered = 0usize;
                    let mut stream = buffer.into_verified_stream();
                    loop {
                        match stream.next().await {
                            Some(Ok(chunk)) => {
                                delivered += chunk.len();
                                yield Ok(chunk);
                            }
                            Some(Err(err)) => {
                                let mut handler = handler_opt.take().expect("handler present");
                                match handler.on_error(err) {
                                    Ok(replacement) => {
                                        // Continue where the failed producer
                                        // left off.
                                        stream = skip_stream(
                                            replacement.into_verified_stream(),
                                            delivered,
                                        );
                                        handler_opt = Some(handler);
                                    }
                                    Err(err) => {
                                        handler.done();
                                        yield Err(err);
                                        return;
                                    }
                                }
                            }
                            None => {
                                handler_opt.take().expect("handler present").done();
                                return;
                            }
                        }
                    }
                })
            }
        }
    }
}

fn error_stream(error: StorageError) -> ChunkStream {
    let items: Vec<Result<Bytes, StorageError>> = vec![Err(error)];
    Box::pin(futures::stream::iter(items))
}

fn verify_bytes(
    digest: &Digest,
    source: &BufferSource,
    data: &Bytes,
) -> Result<(), StorageError> {
    if !source.requires_verification() {
        return Ok(());
    }
    if data.len() != digest.size_bytes() {
        source.observe(false);
        return Err(StorageError::InvalidSize {
            expected_size: digest.size_bytes(),
            actual_size: data.len(),
            is_data_loss: source.is_data_loss(),
        });
    }
    let mut hasher = digest.digest_function().hasher();
    hasher.update(data);
    let actual = hasher.finalize();
    if actual[..] != *digest.hash_bytes() {
        source.observe(false);
        return Err(StorageError::InvalidHash {
            expected_hash: digest.hash_hex(),
            actual_hash: hex::encode(actual),
            is_data_loss: source.is_data_loss(),
        });
    }
    source.observe(true);
    Ok(())
}

/// Wrap a chunk stream with incremental integrity verification: a running
/// hash is accumulated as chunks are delivered and compared to the expected
/// digest at end of stream. Contents past the declared size are dropped and
/// reported as an error.
fn apply_verification(digest: Digest, source: BufferSource, stream: ChunkStream) -> ChunkStream {
    if !source.requires_verification() {
        return stream;
    }
    let mut stream = stream;
    Box::pin(async_stream::stream! {
        let declared_size = digest.size_bytes();
        let mut hasher = digest.digest_function().hasher();
        let mut delivered = 0usize;

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if delivered + chunk.len() > declared_size {
                let observed = delivered + chunk.len();
                let keep = declared_size - delivered;
                if keep > 0 {
                    let chunk = chunk.slice(0..keep);
                    hasher.update(&chunk);
                    yield Ok(chunk);
                }
                source.observe(false);
                yield Err(StorageError::InvalidSize {
                    expected_size: declared_size,
                    actual_size: observed,
                    is_data_loss: source.is_data_loss(),
                });
                return;
            }
            hasher.update(&chunk);
            delivered += chunk.len();
            yield Ok(chunk);
        }

        if delivered != declared_size {
            source.observe(false);
            yield Err(StorageError::InvalidSize {
                expected_size: declared_size,
                actual_size: delivered,
                is_data_loss: source.is_data_loss(),
            });
            return;
        }

        let actual = hasher.finalize();
        if actual[..] != *digest.hash_bytes() {
            source.observe(false);
            yield Err(StorageError::InvalidHash {
                expected_hash: digest.hash_hex(),
                actual_hash: hex::encode(actual),
                is_data_loss: source.is_data_loss(),
            });
            return;
        }
        source.observe(true);
    })
}

/// Discard the first `skip` bytes of a stream.
fn skip_stream(stream: ChunkStream, skip: usize) -> ChunkStream {
    if skip == 0 {
        return stream;
    }
    let mut stream = stream;
    Box::pin(async_stream::stream! {
        let mut remaining = skip;
        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if remaining >= chunk.len() {
                remaining -= chunk.len();
                continue;
            }
            let chunk = chunk.slice(remaining..);
            remaining = 0;
            if !chunk.is_empty() {
                yield Ok(chunk);
            }
        }
    })
}

/// Re-batch a stream into chunks of at most `chunk_size` bytes.
fn rechunk_stream(stream: ChunkStream, chunk_size: usize) -> ChunkStream {
    let mut stream = stream;
    Box::pin(async_stream::stream! {
        while let Some(chunk_result) = stream.next().await {
            let mut chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            while chunk.len() > chunk_size {
                yield Ok(chunk.slice(0..chunk_size));
                chunk = chunk.slice(chunk_size..);
            }
            if !chunk.is_empty() {
                yield Ok(chunk);
            }
        }
    })
}

/// Consolidate a stream of `Bytes` into a single `Bytes`.
pub async fn consolidate_stream(
    mut stream: impl Stream<Item = Result<Bytes, StorageError>> + Unpin,
) -> Result<Bytes, StorageError> {
    let mut buffers: Vec<Bytes> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffers.push(chunk?);
    }
    match buffers.len() {
        0 => return Ok(Bytes::new()),
        1 => return Ok(buffers.pop().expect("one buffer")),
        _ => {}
    }
    let result_len = buffers.iter().map(|b| b.len()).sum();
    let mut result = bytes::BytesMut::with_capacity(result_len);
    for buffer in buffers {
        result.extend_from_slice(&buffer);
    }
    Ok(result.freeze())
}
