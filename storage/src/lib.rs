// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default, clippy::len_without_is_empty)]

pub mod access;
pub mod api;
pub mod buffer;
pub mod config;
mod error;
pub mod replicator;

pub use digest::Digest;
pub use error::StorageError;

pub mod testutil;
