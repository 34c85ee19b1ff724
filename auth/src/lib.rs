// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::result_large_err)]

//! The authentication pipeline: pluggable authenticators with AND/ANY
//! composition, evaluated against the transport-level context of each
//! request before it reaches the storage tree.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tonic::metadata::MetadataMap;
use tonic::Status;

mod extract;
mod jwks;
mod jwt;
mod peer;
mod remote;
mod tls;

pub use extract::MetadataExtractor;
pub use jwks::{KeySetProvider, RemoteJwks, StaticJwks};
pub use jwt::{fixed_clock, JwtAuthenticator, SignatureVerifier};
pub use peer::PeerCredentialsAuthenticator;
pub use remote::{RemoteAuthClient, RemoteAuthenticator};
pub use tls::ClientCertificateAuthenticator;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// No or invalid credential; the caller can fix this.
    Unauthenticated(String),
    /// Service-side fault while evaluating credentials.
    Internal(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Unauthenticated(msg) => write!(f, "Unauthenticated: {msg}"),
            AuthError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(msg) => Status::unauthenticated(msg),
            AuthError::Internal(msg) => Status::internal(msg),
        }
    }
}

/// What a successful authentication tells the rest of the request pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthenticationMetadata {
    /// Safe to show in traces and logs.
    pub public: serde_json::Map<String, Value>,
    /// Usable by policy decisions, never logged.
    pub private: serde_json::Map<String, Value>,
    /// Key/value pairs attached to the request span under an `auth.` prefix.
    pub tracing_attributes: Vec<(String, String)>,
}

impl AuthenticationMetadata {
    /// Shallow-merge `other` on top of `self`: later values win per key, and
    /// tracing attributes concatenate preserving order.
    pub fn merge(mut self, other: AuthenticationMetadata) -> AuthenticationMetadata {
        self.public.extend(other.public);
        self.private.extend(other.private);
        self.tracing_attributes.extend(other.tracing_attributes);
        self
    }

    /// Emit the tracing attributes onto the current span's context.
    pub fn record_tracing_attributes(&self) {
        for (key, value) in &self.tracing_attributes {
            tracing::debug!(key = %format!("auth.{key}"), value = %value, "authentication attribute");
        }
    }
}

/// Credentials of the peer of a UNIX socket connection, as reported by the
/// kernel for the connection's file descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

/// The transport-level facts an authenticator may consult. Assembled by the
/// serving layer from the request headers and connection info.
pub struct RequestContext<'a> {
    pub metadata: &'a MetadataMap,
    /// DER-encoded peer certificate chain, leaf first. Empty when the
    /// connection did not present one.
    pub peer_certificates: &'a [Vec<u8>],
    pub peer_credentials: Option<&'a PeerCredentials>,
}

impl<'a> RequestContext<'a> {
    pub fn from_metadata(metadata: &'a MetadataMap) -> Self {
        RequestContext {
            metadata,
            peer_certificates: &[],
            peer_credentials: None,
        }
    }
}

/// Decides whether a request may proceed, and with which metadata.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError>;
}

#[async_trait]
impl<A> Authenticator for Arc<A>
where
    A: Authenticator + ?Sized,
{
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        (**self).authenticate(context).await
    }
}

/// Always succeeds with fixed metadata. The root of deployments that do not
/// authenticate, and a handy leaf in tests.
pub struct AllowAuthenticator {
    metadata: AuthenticationMetadata,
}

impl AllowAuthenticator {
    pub fn new(metadata: AuthenticationMetadata) -> Self {
        AllowAuthenticator { metadata }
    }
}

#[async_trait]
impl Authenticator for AllowAuthenticator {
    async fn authenticate(
        &self,
        _context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        Ok(self.metadata.clone())
    }
}

/// Always fails with a configured message.
pub struct DenyAuthenticator {
    message: String,
}

impl DenyAuthenticator {
    pub fn new(message: impl Into<String>) -> Self {
        DenyAuthenticator {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Authenticator for DenyAuthenticator {
    async fn authenticate(
        &self,
        _context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        Err(AuthError::Unauthenticated(self.message.clone()))
    }
}

/// Tries children in order; the first success wins. When every child fails,
/// a service-side fault outranks credential problems; otherwise the
/// deduplicated credential failures are reported together.
pub struct AnyAuthenticator {
    children: Vec<Arc<dyn Authenticator>>,
}

impl AnyAuthenticator {
    pub fn new(children: Vec<Arc<dyn Authenticator>>) -> Self {
        AnyAuthenticator { children }
    }
}

#[async_trait]
impl Authenticator for AnyAuthenticator {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let mut messages: Vec<String> = Vec::new();
        let mut internal_error: Option<AuthError> = None;
        for child in &self.children {
            match child.authenticate(context).await {
                Ok(metadata) => return Ok(metadata),
                Err(AuthError::Unauthenticated(message)) => {
                    if !messages.contains(&message) {
                        messages.push(message);
                    }
                }
                Err(err @ AuthError::Internal(_)) => internal_error = Some(err),
            }
        }
        match internal_error {
            Some(err) => Err(err),
            None => Err(AuthError::Unauthenticated(messages.join(", "))),
        }
    }
}

/// Requires every child to succeed, failing fast on the first non-success.
/// Metadata from all children is merged, later children overriding earlier
/// ones on key collisions.
pub struct AllAuthenticator {
    children: Vec<Arc<dyn Authenticator>>,
}

impl AllAuthenticator {
    pub fn new(children: Vec<Arc<dyn Authenticator>>) -> Self {
        AllAuthenticator { children }
    }
}

#[async_trait]
impl Authenticator for AllAuthenticator {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let mut merged = AuthenticationMetadata::default();
        for child in &self.children {
            merged = merged.merge(child.authenticate(context).await?);
        }
        Ok(merged)
    }
}

/// Extract the bearer auth token from the request's headers.
pub fn get_bearer_token(metadata: &MetadataMap) -> Result<String, AuthError> {
    let auth_value = metadata
        .get("authorization")
        .ok_or_else(|| AuthError::Unauthenticated("authorization header not provided".to_owned()))?
        .to_str()
        .map_err(|err| {
            AuthError::Unauthenticated(format!("authorization header is not ASCII: {err}"))
        })?;
    auth_value
        .strip_prefix("Bearer ")
        .map(|token| token.to_owned())
        .ok_or_else(|| {
            AuthError::Unauthenticated(
                "authorization header did not start with `Bearer `".to_owned(),
            )
        })
}
