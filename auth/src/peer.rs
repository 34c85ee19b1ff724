// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use serde_json::json;

use crate::{
    AuthError, AuthenticationMetadata, Authenticator, MetadataExtractor, RequestContext,
};

/// Authenticates local callers by the credentials the kernel reports for
/// their UNIX socket connection. The serving layer extracts the UID and
/// group list from the connection's file descriptor and places them on the
/// request context.
pub struct PeerCredentialsAuthenticator {
    metadata_extractor: MetadataExtractor,
}

impl PeerCredentialsAuthenticator {
    pub fn new(metadata_extractor: MetadataExtractor) -> Self {
        PeerCredentialsAuthenticator { metadata_extractor }
    }
}

#[async_trait]
impl Authenticator for PeerCredentialsAuthenticator {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let credentials = context.peer_credentials.ok_or_else(|| {
            AuthError::Unauthenticated(
                "Connection was not established over a UNIX socket".to_owned(),
            )
        })?;
        let view = json!({
            "uid": credentials.uid,
            "gid": credentials.gid,
            "groups": credentials.groups,
        });
        self.metadata_extractor.extract(&view)
    }
}
