// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]

// Hand-maintained mirrors of the subset of the Remote Execution API and
// Google API messages this workspace speaks, plus our private packages.
// Field numbers match the published protos so the encoding stays
// bit-compatible on the wire without running protoc at build time.

pub mod build {
    pub mod bazel {
        pub mod remote {
            pub mod execution {
                pub mod v2;
            }
        }
        pub mod semver;
    }
}

pub mod google {
    pub mod bytestream;
    pub mod rpc;
}

pub mod casgrid {
    pub mod icas;
    pub mod replication;
}
