// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The ByteStream resource-name grammar:
//!
//! ```text
//! [<instance>/](blobs|compressed-blobs/<scheme>)/<hash>/<size>
//! [<instance>/]uploads/<uuid>/(blobs|compressed-blobs/<scheme>)/<hash>/<size>
//! ```

use std::fmt;

use uuid::Uuid;

use crate::{Digest, DigestFunction, InstanceName};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceError {
    InvalidArgument(String),
    /// Unknown compression scheme. Parsing recognizes the scheme tokens of
    /// the Remote Execution API; anything else is not malformed, just not
    /// supported.
    Unimplemented(String),
}

impl std::error::Error for ResourceError {}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::InvalidArgument(msg) => write!(f, "Invalid resource name: {msg}"),
            ResourceError::Unimplemented(msg) => write!(f, "Unsupported resource name: {msg}"),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ResourceError {
    ResourceError::InvalidArgument(msg.into())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compressor {
    Identity,
    Zstd,
    Deflate,
}

impl Compressor {
    fn from_scheme(scheme: &str) -> Result<Self, ResourceError> {
        match scheme {
            "zstd" => Ok(Compressor::Zstd),
            "deflate" => Ok(Compressor::Deflate),
            other => Err(ResourceError::Unimplemented(format!(
                "Unknown compression scheme {other:?}"
            ))),
        }
    }

    fn scheme(&self) -> Option<&'static str> {
        match self {
            Compressor::Identity => None,
            Compressor::Zstd => Some("zstd"),
            Compressor::Deflate => Some("deflate"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadResourceName {
    pub digest: Digest,
    pub compressor: Compressor,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteResourceName {
    pub digest: Digest,
    pub uuid: Uuid,
    pub compressor: Compressor,
}

/// Parse the components shared by read and write resource names, starting at
/// the `blobs`/`compressed-blobs` keyword.
fn parse_blobs_suffix(parts: &[&str]) -> Result<(Compressor, Digest), ResourceError> {
    let (compressor, rest) = match parts.first() {
        Some(&"blobs") => (Compressor::Identity, &parts[1..]),
        Some(&"compressed-blobs") => {
            let scheme = parts
                .get(1)
                .ok_or_else(|| invalid("missing compression scheme after `compressed-blobs`"))?;
            (Compressor::from_scheme(scheme)?, &parts[2..])
        }
        _ => return Err(invalid("expected `blobs` or `compressed-blobs` component")),
    };

    let hash = rest
        .first()
        .ok_or_else(|| invalid("missing hash component"))?;
    let size = rest
        .get(1)
        .ok_or_else(|| invalid("missing size component"))?;
    let size = size
        .parse::<i64>()
        .map_err(|_| invalid(format!("cannot parse size {size:?}")))?;

    let digest_function = DigestFunction::from_hash_length(hash.len() / 2).map_err(invalid)?;
    let digest = Digest::new(InstanceName::root(), digest_function, hash, size).map_err(invalid)?;
    Ok((compressor, digest))
}

fn instance_from_parts(parts: &[&str]) -> Result<InstanceName, ResourceError> {
    InstanceName::new(parts.join("/")).map_err(invalid)
}

/// Parse a download resource name. Consecutive slashes collapse.
pub fn parse_read_resource_name(resource: &str) -> Result<ReadResourceName, ResourceError> {
    if resource.is_empty() {
        return Err(invalid("empty resource name"));
    }
    let parts: Vec<&str> = resource.split('/').filter(|p| !p.is_empty()).collect();

    let keyword_index = parts
        .iter()
        .position(|p| *p == "blobs" || *p == "compressed-blobs")
        .ok_or_else(|| invalid(format!("{resource:?} has no `blobs` component")))?;

    let instance_name = instance_from_parts(&parts[..keyword_index])?;
    let (compressor, digest) = parse_blobs_suffix(&parts[keyword_index..])?;
    Ok(ReadResourceName {
        digest: digest.with_instance_name(instance_name),
        compressor,
    })
}

/// Parse an upload resource name. Consecutive slashes collapse.
pub fn parse_write_resource_name(resource: &str) -> Result<WriteResourceName, ResourceError> {
    if resource.is_empty() {
        return Err(invalid("empty resource name"));
    }
    let parts: Vec<&str> = resource.split('/').filter(|p| !p.is_empty()).collect();

    let uploads_index = parts
        .iter()
        .position(|p| *p == "uploads")
        .ok_or_else(|| invalid(format!("{resource:?} has no `uploads` component")))?;

    let instance_name = instance_from_parts(&parts[..uploads_index])?;
    let uuid = parts
        .get(uploads_index + 1)
        .ok_or_else(|| invalid("missing upload UUID component"))?;
    let uuid =
        Uuid::parse_str(uuid).map_err(|_| invalid(format!("cannot parse UUID {uuid:?}")))?;

    let (compressor, digest) = parse_blobs_suffix(&parts[uploads_index + 2..])?;
    Ok(WriteResourceName {
        digest: digest.with_instance_name(instance_name),
        uuid,
        compressor,
    })
}

pub fn format_read_resource_name(digest: &Digest, compressor: Compressor) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !digest.instance_name().is_root() {
        parts.push(digest.instance_name().to_string());
    }
    match compressor.scheme() {
        None => parts.push("blobs".to_owned()),
        Some(scheme) => {
            parts.push("compressed-blobs".to_owned());
            parts.push(scheme.to_owned());
        }
    }
    parts.push(digest.hash_hex());
    parts.push(digest.size_bytes().to_string());
    parts.join("/")
}

pub fn format_write_resource_name(
    digest: &Digest,
    uuid: &Uuid,
    compressor: Compressor,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !digest.instance_name().is_root() {
        parts.push(digest.instance_name().to_string());
    }
    parts.push("uploads".to_owned());
    parts.push(uuid.to_string());
    match compressor.scheme() {
        None => parts.push("blobs".to_owned()),
        Some(scheme) => {
            parts.push("compressed-blobs".to_owned());
            parts.push(scheme.to_owned());
        }
    }
    parts.push(digest.hash_hex());
    parts.push(digest.size_bytes().to_string());
    parts.join("/")
}
