// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName, InstanceNameTrie};

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// Restricts writes to instance names covered by a configured prefix set.
/// Reads pass through untouched. Capabilities reflect the gate, so clients
/// that honor `update_enabled` never attempt a forbidden write.
pub struct UpdateGatingAccess<BA> {
    allowed_instance_names: InstanceNameTrie,
    underlying: BA,
}

impl<BA> UpdateGatingAccess<BA> {
    pub fn new(underlying: BA, allowed_instance_name_prefixes: &[InstanceName]) -> Self {
        let mut allowed_instance_names = InstanceNameTrie::new();
        for (index, prefix) in allowed_instance_name_prefixes.iter().enumerate() {
            allowed_instance_names.set(prefix, index);
        }
        UpdateGatingAccess {
            allowed_instance_names,
            underlying,
        }
    }
}

#[async_trait]
impl<BA> BlobAccess for UpdateGatingAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        self.underlying.get(digest)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        if !self.allowed_instance_names.contains(digest.instance_name()) {
            buffer.discard();
            return Err(StorageError::PermissionDenied(format!(
                "Updates are not permitted for instance name {:?}",
                digest.instance_name().as_str()
            )));
        }
        self.underlying.put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(digests).await
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        let capabilities = self.underlying.get_capabilities(instance_name).await?;
        Ok(Capabilities {
            update_enabled: self.allowed_instance_names.contains(instance_name),
            ..capabilities
        })
    }
}

#[cfg(test)]
mod tests {
    use digest::{InstanceName, KeyFormat};

    use super::UpdateGatingAccess;
    use crate::access::{BlobAccess, MemoryAccess};
    use crate::error::StorageError;
    use crate::testutil::TestData;

    fn gated() -> UpdateGatingAccess<MemoryAccess> {
        UpdateGatingAccess::new(
            MemoryAccess::content_addressed(KeyFormat::WithInstance),
            &[InstanceName::new("main").unwrap()],
        )
    }

    #[tokio::test]
    async fn writes_allowed_for_covered_instances() {
        let content = TestData::from_static(b"foobar");
        let storage = gated();

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

        let capabilities = storage
            .get_capabilities(content.digest.instance_name())
            .await
            .unwrap();
        assert!(capabilities.update_enabled);

        // Nested instances inherit the permission from the prefix.
        let capabilities = storage
            .get_capabilities(&InstanceName::new("main/ci").unwrap())
            .await
            .unwrap();
        assert!(capabilities.update_enabled);
    }

    #[tokio::test]
    async fn writes_denied_elsewhere() {
        let content = TestData::with_instance("other", b"foobar");
        let storage = gated();

        let err = storage
            .put(content.digest.clone(), content.user_buffer())
            .await
            .unwrap_err();
        match err {
            StorageError::PermissionDenied(msg) => assert!(msg.contains("other"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }

        let capabilities = storage
            .get_capabilities(content.digest.instance_name())
            .await
            .unwrap();
        assert!(!capabilities.update_enabled);
    }
}
