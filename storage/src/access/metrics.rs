// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Instant;

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName};
use metrics::{counter, histogram};

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::{Buffer, ErrorHandler};
use crate::error::StorageError;

const OK_LABEL: &str = "ok";
const ERR_LABEL: &str = "err";

/// Observes latency and outcome of calls into an underlying access. Does not
/// alter semantics.
#[derive(Clone)]
pub struct MetricsMonitoredAccess<BA> {
    driver_label: &'static str,
    inner: BA,
}

impl<BA> MetricsMonitoredAccess<BA> {
    pub fn new(inner: BA, driver_label: &'static str) -> Self {
        MetricsMonitoredAccess {
            driver_label,
            inner,
        }
    }
}

fn emit(
    driver_label: &'static str,
    operation: &'static str,
    start_time: Instant,
    result_label: &'static str,
) {
    counter!(
        "casgrid_storage_requests_handled_total",
        1,
        "operation" => operation,
        "driver" => driver_label,
        "result" => result_label,
    );
    histogram!(
        "casgrid_storage_requests_handling_seconds",
        start_time.elapsed(),
        "operation" => operation,
        "driver" => driver_label,
        "result" => result_label,
    );
}

/// Records the duration of a lazy read once its buffer is fully consumed or
/// dropped.
struct ReadObserver {
    driver_label: &'static str,
    start_time: Instant,
    failed: bool,
}

impl ErrorHandler for ReadObserver {
    fn on_error(&mut self, err: StorageError) -> Result<Buffer, StorageError> {
        self.failed = true;
        Err(err)
    }
}

impl Drop for ReadObserver {
    fn drop(&mut self) {
        let result_label = if self.failed { ERR_LABEL } else { OK_LABEL };
        emit(self.driver_label, "get", self.start_time, result_label);
    }
}

#[async_trait]
impl<BA> BlobAccess for MetricsMonitoredAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        counter!(
            "casgrid_storage_requests_started_total",
            1,
            "operation" => "get",
            "driver" => self.driver_label,
        );
        self.inner
            .get(digest)
            .with_error_handler(Box::new(ReadObserver {
                driver_label: self.driver_label,
                start_time: Instant::now(),
                failed: false,
            }))
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        counter!(
            "casgrid_storage_requests_started_total",
            1,
            "operation" => "put",
            "driver" => self.driver_label,
        );
        if let Ok(size) = buffer.size_bytes() {
            counter!(
                "casgrid_storage_bytes_written_total",
                size as u64,
                "driver" => self.driver_label,
            );
        }
        let start_time = Instant::now();
        let result = self.inner.put(digest, buffer).await;
        emit(
            self.driver_label,
            "put",
            start_time,
            if result.is_ok() { OK_LABEL } else { ERR_LABEL },
        );
        result
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        counter!(
            "casgrid_storage_requests_started_total",
            1,
            "operation" => "find_missing",
            "driver" => self.driver_label,
        );
        counter!(
            "casgrid_storage_find_missing_digests_total",
            digests.len() as u64,
            "driver" => self.driver_label,
        );
        let start_time = Instant::now();
        let result = self.inner.find_missing(digests).await;
        emit(
            self.driver_label,
            "find_missing",
            start_time,
            if result.is_ok() { OK_LABEL } else { ERR_LABEL },
        );
        result
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let start_time = Instant::now();
        let result = self.inner.get_capabilities(instance_name).await;
        emit(
            self.driver_label,
            "get_capabilities",
            start_time,
            if result.is_ok() { OK_LABEL } else { ERR_LABEL },
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use digest::{DigestSet, KeyFormat};

    use super::MetricsMonitoredAccess;
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::testutil::TestData;

    #[tokio::test]
    async fn semantics_are_unchanged() {
        let content = TestData::from_static(b"foobar");
        let storage = MetricsMonitoredAccess::new(
            MemoryAccess::content_addressed(KeyFormat::WithoutInstance),
            "memory",
        );

        storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap();
        let data = storage
            .get(&content.digest)
            .into_bytes(1024)
            .await
            .unwrap();
        assert_eq!(data, content.bytes);
        let missing = storage
            .find_missing(DigestSet::single(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
