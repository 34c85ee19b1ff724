// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The mirror-repair protocol. A replication request names digests to copy
//! from the source backend to the sink backend; completion of the RPC is the
//! only success signal, so there is no response payload beyond the empty
//! message.

use crate::build::bazel::remote::execution::v2 as remexec;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateBlobsRequest {
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(enumeration = "remexec::digest_function::Value", tag = "2")]
    pub digest_function: i32,
    #[prost(message, repeated, tag = "3")]
    pub blob_digests: Vec<remexec::Digest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateBlobsResponse {}
