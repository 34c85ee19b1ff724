// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Messages from `build.bazel.remote.execution.v2` used by the storage plane.

/// The content digest of a blob: lowercase hex hash plus size in bytes.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Digest {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

pub mod digest_function {
    /// The digest function used to compute a `Digest`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Value {
        Unknown = 0,
        Sha256 = 1,
        Sha1 = 2,
        Md5 = 3,
        Vso = 4,
        Sha384 = 5,
        Sha512 = 6,
        Murmur3 = 7,
        Sha256tree = 8,
        Blake3 = 9,
    }
}

pub mod compressor {
    /// Compression scheme for `compressed-blobs` resources and batch payloads.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Value {
        Identity = 0,
        Zstd = 1,
        Deflate = 2,
        Brotli = 3,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingBlobsRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, repeated, tag = "2")]
    pub blob_digests: Vec<Digest>,
    #[prost(enumeration = "digest_function::Value", tag = "3")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingBlobsResponse {
    #[prost(message, repeated, tag = "2")]
    pub missing_blob_digests: Vec<Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchUpdateBlobsRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, repeated, tag = "2")]
    pub requests: Vec<batch_update_blobs_request::Request>,
    #[prost(enumeration = "digest_function::Value", tag = "5")]
    pub digest_function: i32,
}

pub mod batch_update_blobs_request {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(message, optional, tag = "1")]
        pub digest: Option<super::Digest>,
        #[prost(bytes = "bytes", tag = "2")]
        pub data: ::bytes::Bytes,
        #[prost(enumeration = "super::compressor::Value", tag = "3")]
        pub compressor: i32,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchUpdateBlobsResponse {
    #[prost(message, repeated, tag = "1")]
    pub responses: Vec<batch_update_blobs_response::Response>,
}

pub mod batch_update_blobs_response {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(message, optional, tag = "1")]
        pub digest: Option<super::Digest>,
        #[prost(message, optional, tag = "2")]
        pub status: Option<crate::google::rpc::Status>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchReadBlobsRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, repeated, tag = "2")]
    pub digests: Vec<Digest>,
    #[prost(enumeration = "compressor::Value", repeated, tag = "3")]
    pub acceptable_compressors: Vec<i32>,
    #[prost(enumeration = "digest_function::Value", tag = "4")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchReadBlobsResponse {
    #[prost(message, repeated, tag = "1")]
    pub responses: Vec<batch_read_blobs_response::Response>,
}

pub mod batch_read_blobs_response {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(message, optional, tag = "1")]
        pub digest: Option<super::Digest>,
        #[prost(bytes = "bytes", tag = "2")]
        pub data: ::bytes::Bytes,
        #[prost(message, optional, tag = "3")]
        pub status: Option<crate::google::rpc::Status>,
        #[prost(enumeration = "super::compressor::Value", tag = "4")]
        pub compressor: i32,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTreeRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, optional, tag = "2")]
    pub root_digest: Option<Digest>,
    #[prost(int32, tag = "3")]
    pub page_size: i32,
    #[prost(string, tag = "4")]
    pub page_token: String,
    #[prost(enumeration = "digest_function::Value", tag = "5")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTreeResponse {
    #[prost(message, repeated, tag = "1")]
    pub directories: Vec<Directory>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: Vec<DirectoryNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
}

/// The cached result of running an action. Only the fields the storage plane
/// inspects are mirrored here.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResult {
    #[prost(message, repeated, tag = "2")]
    pub output_files: Vec<OutputFile>,
    #[prost(int32, tag = "4")]
    pub exit_code: i32,
    #[prost(message, optional, tag = "6")]
    pub stdout_digest: Option<Digest>,
    #[prost(message, optional, tag = "8")]
    pub stderr_digest: Option<Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputFile {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetActionResultRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, optional, tag = "2")]
    pub action_digest: Option<Digest>,
    #[prost(bool, tag = "3")]
    pub inline_stdout: bool,
    #[prost(bool, tag = "4")]
    pub inline_stderr: bool,
    #[prost(enumeration = "digest_function::Value", tag = "6")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateActionResultRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, optional, tag = "2")]
    pub action_digest: Option<Digest>,
    #[prost(message, optional, tag = "3")]
    pub action_result: Option<ActionResult>,
    #[prost(enumeration = "digest_function::Value", tag = "5")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetCapabilitiesRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerCapabilities {
    #[prost(message, optional, tag = "1")]
    pub cache_capabilities: Option<CacheCapabilities>,
    #[prost(message, optional, tag = "4")]
    pub low_api_version: Option<crate::build::bazel::semver::SemVer>,
    #[prost(message, optional, tag = "5")]
    pub high_api_version: Option<crate::build::bazel::semver::SemVer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CacheCapabilities {
    #[prost(enumeration = "digest_function::Value", repeated, tag = "1")]
    pub digest_functions: Vec<i32>,
    #[prost(message, optional, tag = "2")]
    pub action_cache_update_capabilities: Option<ActionCacheUpdateCapabilities>,
    #[prost(int64, tag = "4")]
    pub max_batch_total_size_bytes: i64,
    #[prost(enumeration = "compressor::Value", repeated, tag = "6")]
    pub supported_compressors: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionCacheUpdateCapabilities {
    #[prost(bool, tag = "1")]
    pub update_enabled: bool,
}
