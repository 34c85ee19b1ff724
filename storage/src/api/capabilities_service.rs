// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use futures::future;
use protos::build::bazel::remote::execution::v2::{
    ActionCacheUpdateCapabilities, CacheCapabilities, GetCapabilitiesRequest, ServerCapabilities,
};
use protos::build::bazel::semver::SemVer;
use tonic::{Request, Response, Status};

use crate::api::{parse_instance_name, InnerServer};

pub struct CapabilitiesService {
    pub(super) inner: Arc<InnerServer>,
}

impl CapabilitiesService {
    #[tracing::instrument(skip_all)]
    pub async fn get_capabilities(
        &self,
        request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;

        // The CAS tree decides digest functions and batch limits; the Action
        // Cache tree decides whether updates are permitted.
        let (cas, action_cache) = future::try_join(
            self.inner.cas.get_capabilities(&instance_name),
            self.inner.action_cache.get_capabilities(&instance_name),
        )
        .await
        .map_err(Status::from)?;

        let max_batch_total_size_bytes = cas
            .max_batch_total_size_bytes
            .unwrap_or(self.inner.max_batch_total_size_bytes);

        let response = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: cas
                    .digest_functions
                    .iter()
                    .map(|f| f.to_proto() as i32)
                    .collect(),
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    update_enabled: action_cache.update_enabled,
                }),
                max_batch_total_size_bytes: max_batch_total_size_bytes as i64,
                supported_compressors: Vec::new(),
            }),
            low_api_version: Some(SemVer {
                major: 2,
                minor: 0,
                patch: 0,
                prerelease: String::new(),
            }),
            high_api_version: Some(SemVer {
                major: 2,
                minor: 3,
                patch: 0,
                prerelease: String::new(),
            }),
        };
        Ok(Response::new(response))
    }
}
