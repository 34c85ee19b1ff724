// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Indirect CAS payload: instead of blob contents, the store holds small
//! references describing where the contents may be fetched from.
//! FindMissingReferences reuses the CAS `FindMissingBlobs` request/response
//! pair; only the update/read payloads differ.

use crate::build::bazel::remote::execution::v2 as remexec;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reference {
    #[prost(string, tag = "1")]
    pub http_url: String,
    #[prost(int64, tag = "2")]
    pub offset_bytes: i64,
    #[prost(int64, tag = "3")]
    pub size_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchUpdateReferencesRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, repeated, tag = "2")]
    pub requests: Vec<batch_update_references_request::Request>,
    #[prost(enumeration = "remexec::digest_function::Value", tag = "3")]
    pub digest_function: i32,
}

pub mod batch_update_references_request {
    use crate::build::bazel::remote::execution::v2 as remexec;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(message, optional, tag = "1")]
        pub digest: Option<remexec::Digest>,
        #[prost(message, optional, tag = "2")]
        pub reference: Option<super::Reference>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchUpdateReferencesResponse {
    #[prost(message, repeated, tag = "1")]
    pub responses: Vec<batch_update_references_response::Response>,
}

pub mod batch_update_references_response {
    use crate::build::bazel::remote::execution::v2 as remexec;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(message, optional, tag = "1")]
        pub digest: Option<remexec::Digest>,
        #[prost(message, optional, tag = "2")]
        pub status: Option<crate::google::rpc::Status>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReferenceRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(message, optional, tag = "2")]
    pub blob_digest: Option<remexec::Digest>,
    #[prost(enumeration = "remexec::digest_function::Value", tag = "3")]
    pub digest_function: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetReferenceResponse {
    #[prost(message, optional, tag = "1")]
    pub reference: Option<Reference>,
}
