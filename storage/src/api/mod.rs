// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Thin adapters that marshal Remote Execution API requests into calls on
//! the storage tree. Methods mirror the generated service trait signatures;
//! transport registration and connection-level concerns (TLS, peer
//! credentials) live outside the core and hand richer request contexts to
//! the authenticator where available.

use std::sync::Arc;

use auth::{AuthenticationMetadata, Authenticator, RequestContext};
use digest::{Digest, DigestFunction, DigestSet, InstanceName};
use itertools::{Either, Itertools};
use protos::build::bazel::remote::execution::v2 as remoting_protos;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::access::BlobAccess;
use crate::replicator::Replicator;

mod action_cache_service;
mod byte_stream_service;
mod capabilities_service;
mod cas_service;
mod reference_service;
mod replication_service;

pub use action_cache_service::ActionCacheService;
pub use byte_stream_service::{ByteStreamService, ReadStream};
pub use capabilities_service::CapabilitiesService;
pub use cas_service::CasService;
pub use reference_service::ReferenceService;
pub use replication_service::ReplicationService;


pub(crate) struct InnerServer {
    pub(crate) cas: Arc<dyn BlobAccess>,
    pub(crate) action_cache: Arc<dyn BlobAccess>,
    pub(crate) indirect_cas: Arc<dyn BlobAccess>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) max_batch_total_size_bytes: usize,
}

impl InnerServer {
    /// Authenticate a request from its headers. Returns the metadata so the
    /// service can attach tracing attributes.
    pub(crate) async fn check_authenticated(
        &self,
        metadata: &MetadataMap,
    ) -> Result<AuthenticationMetadata, Status> {
        let context = RequestContext::from_metadata(metadata);
        let authentication = self
            .authenticator
            .authenticate(&context)
            .await
            .map_err(Status::from)?;
        authentication.record_tracing_attributes();
        Ok(authentication)
    }
}

/// The storage front end: holds the assembled storage trees and produces the
/// per-protocol service adapters.
pub struct Server {
    inner: Arc<InnerServer>,
}

impl Server {
    /// Maximum total size of blobs processed through the batch CAS APIs,
    /// unless configured otherwise. Matches the 4 MB gRPC message ceiling.
    pub const DEFAULT_MAX_BATCH_TOTAL_SIZE_BYTES: usize = 4 * 1024 * 1024;

    pub fn new(
        cas: Arc<dyn BlobAccess>,
        action_cache: Arc<dyn BlobAccess>,
        indirect_cas: Arc<dyn BlobAccess>,
        authenticator: Arc<dyn Authenticator>,
        max_batch_total_size_bytes: usize,
    ) -> Self {
        Server {
            inner: Arc::new(InnerServer {
                cas,
                action_cache,
                indirect_cas,
                authenticator,
                max_batch_total_size_bytes,
            }),
        }
    }

    pub fn cas_service(&self) -> CasService {
        CasService {
            inner: self.inner.clone(),
        }
    }

    pub fn byte_stream_service(&self) -> ByteStreamService {
        ByteStreamService {
            inner: self.inner.clone(),
        }
    }

    pub fn action_cache_service(&self) -> ActionCacheService {
        ActionCacheService {
            inner: self.inner.clone(),
        }
    }

    pub fn capabilities_service(&self) -> CapabilitiesService {
        CapabilitiesService {
            inner: self.inner.clone(),
        }
    }

    pub fn reference_service(&self) -> ReferenceService {
        ReferenceService {
            inner: self.inner.clone(),
        }
    }

    pub fn replication_service(
        &self,
        replicator: Arc<dyn Replicator>,
        max_batch_size: usize,
    ) -> ReplicationService {
        ReplicationService {
            inner: self.inner.clone(),
            replicator,
            max_batch_size,
        }
    }
}

/// Parse an instance name from a request, surfacing `invalid argument` with
/// the offending input quoted.
pub(crate) fn parse_instance_name(name: &str) -> Result<InstanceName, Status> {
    InstanceName::new(name).map_err(Status::invalid_argument)
}

/// Resolve the request-level digest function for one wire digest.
pub(crate) fn convert_digest(
    instance_name: &InstanceName,
    digest_function: i32,
    api_digest: &remoting_protos::Digest,
) -> Result<Digest, String> {
    let function = DigestFunction::resolve(digest_function, api_digest.hash.len() / 2)?;
    Digest::from_proto(instance_name.clone(), function, api_digest)
}

/// Convert a list of wire digests into a `DigestSet`, collecting every
/// per-digest error into one `invalid argument` status.
pub(crate) fn convert_digests(
    instance_name: &InstanceName,
    digest_function: i32,
    api_digests: &[remoting_protos::Digest],
) -> Result<DigestSet, Status> {
    let (digests, errors): (Vec<_>, Vec<_>) = api_digests
        .iter()
        .map(|d| convert_digest(instance_name, digest_function, d))
        .partition_map(|r| match r {
            Ok(d) => Either::Left(d),
            Err(e) => Either::Right(e),
        });

    if !errors.is_empty() {
        return Err(Status::invalid_argument(format!(
            "digest errors: {}",
            errors.join(", ")
        )));
    }

    Ok(digests.into_iter().collect())
}
