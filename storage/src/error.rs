// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use tonic::Status;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    Cancelled(String),
    InvalidArgument(String),
    InvalidSize {
        expected_size: usize,
        actual_size: usize,
        is_data_loss: bool,
    },
    InvalidHash {
        expected_hash: String,
        actual_hash: String,
        is_data_loss: bool,
    },
    NotFound(String),
    PermissionDenied(String),
    Unauthenticated(String),
    ResourceExhausted(String),
    Unimplemented(String),
    DeadlineExceeded(String),
    Unavailable(String),
    OutOfRange(String, usize),
    Internal(String),
}

impl std::error::Error for StorageError {}

impl StorageError {
    /// Whether retrying the operation against the same backend may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
            StorageError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            StorageError::InvalidSize {
                expected_size,
                actual_size,
                is_data_loss,
            } => {
                if *is_data_loss {
                    write!(
                        f,
                        "Invalid size detected for content in data store (expected {expected_size} bytes, observed {actual_size} bytes)"
                    )
                } else {
                    write!(
                        f,
                        "Invalid size for provided content (expected {expected_size} bytes, observed {actual_size} bytes)"
                    )
                }
            }
            StorageError::InvalidHash {
                expected_hash,
                actual_hash,
                is_data_loss,
            } => {
                if *is_data_loss {
                    write!(
                        f,
                        "Invalid hash detected for content in data store (expected hash was {expected_hash}, observed hash is {actual_hash})"
                    )
                } else {
                    write!(
                        f,
                        "Invalid hash for provided content (expected hash was {expected_hash}, observed hash is {actual_hash})"
                    )
                }
            }
            StorageError::NotFound(msg) => write!(f, "Not found: {msg}"),
            StorageError::PermissionDenied(msg) => write!(f, "Permission denied: {msg}"),
            StorageError::Unauthenticated(msg) => write!(f, "Unauthenticated: {msg}"),
            StorageError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {msg}"),
            StorageError::Unimplemented(msg) => write!(f, "Unimplemented: {msg}"),
            StorageError::DeadlineExceeded(msg) => write!(f, "Deadline exceeded: {msg}"),
            StorageError::Unavailable(msg) => write!(f, "{msg}"),
            StorageError::OutOfRange(param_name, value) => {
                write!(f, "Out-of-range value {value} for parameter {param_name}")
            }
            StorageError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<String> for StorageError {
    fn from(msg: String) -> Self {
        StorageError::Internal(msg)
    }
}

impl From<StorageError> for String {
    fn from(err: StorageError) -> Self {
        format!("{err}")
    }
}

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled(msg) => Status::cancelled(msg),
            StorageError::InvalidArgument(msg) => Status::invalid_argument(msg),
            StorageError::InvalidSize { is_data_loss, .. }
            | StorageError::InvalidHash { is_data_loss, .. } => {
                let msg = format!("{err}");
                if is_data_loss {
                    Status::data_loss(msg)
                } else {
                    Status::invalid_argument(msg)
                }
            }
            StorageError::NotFound(msg) => Status::not_found(msg),
            StorageError::PermissionDenied(msg) => Status::permission_denied(msg),
            StorageError::Unauthenticated(msg) => Status::unauthenticated(msg),
            StorageError::ResourceExhausted(msg) => Status::resource_exhausted(msg),
            StorageError::Unimplemented(msg) => Status::unimplemented(msg),
            StorageError::DeadlineExceeded(msg) => Status::deadline_exceeded(msg),
            StorageError::Unavailable(msg) => Status::unavailable(msg),
            StorageError::OutOfRange(_, _) => {
                let msg = format!("{err}");
                Status::out_of_range(msg)
            }
            StorageError::Internal(msg) => Status::internal(msg),
        }
    }
}

impl From<Status> for StorageError {
    fn from(status: Status) -> Self {
        use tonic::Code;

        let msg = status.message().to_owned();
        match status.code() {
            Code::Cancelled => StorageError::Cancelled(msg),
            Code::InvalidArgument => StorageError::InvalidArgument(msg),
            Code::NotFound => StorageError::NotFound(msg),
            Code::PermissionDenied => StorageError::PermissionDenied(msg),
            Code::Unauthenticated => StorageError::Unauthenticated(msg),
            Code::ResourceExhausted => StorageError::ResourceExhausted(msg),
            Code::Unimplemented => StorageError::Unimplemented(msg),
            Code::DeadlineExceeded => StorageError::DeadlineExceeded(msg),
            Code::DataLoss => StorageError::Internal(format!("Data loss: {msg}")),
            Code::Internal => StorageError::Internal(msg),
            // Transport-level failures all surface as unavailable, which is
            // the retryable kind.
            _ => StorageError::Unavailable(msg),
        }
    }
}

impl From<StorageError> for protos::google::rpc::Status {
    fn from(err: StorageError) -> Self {
        use protos::google::rpc::Code;

        let code = match &err {
            StorageError::Cancelled(_) => Code::Cancelled,
            StorageError::InvalidArgument(_) => Code::InvalidArgument,
            StorageError::InvalidSize { is_data_loss, .. }
            | StorageError::InvalidHash { is_data_loss, .. } => {
                if *is_data_loss {
                    Code::DataLoss
                } else {
                    Code::InvalidArgument
                }
            }
            StorageError::NotFound(_) => Code::NotFound,
            StorageError::PermissionDenied(_) => Code::PermissionDenied,
            StorageError::Unauthenticated(_) => Code::Unauthenticated,
            StorageError::ResourceExhausted(_) => Code::ResourceExhausted,
            StorageError::Unimplemented(_) => Code::Unimplemented,
            StorageError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            StorageError::Unavailable(_) => Code::Unavailable,
            StorageError::OutOfRange(_, _) => Code::OutOfRange,
            StorageError::Internal(_) => Code::Internal,
        };
        protos::google::rpc::Status {
            code: code as i32,
            message: format!("{err}"),
        }
    }
}
