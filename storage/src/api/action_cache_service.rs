// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use protos::build::bazel::remote::execution::v2::{
    ActionResult, GetActionResultRequest, UpdateActionResultRequest,
};
use tonic::{Request, Response, Status};

use crate::api::{convert_digest, parse_instance_name, InnerServer};
use crate::buffer::Buffer;

pub struct ActionCacheService {
    pub(super) inner: Arc<InnerServer>,
}

impl ActionCacheService {
    #[tracing::instrument(skip_all)]
    pub async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;
        let action_digest = request
            .action_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Missing action_digest"))?;
        let digest = convert_digest(&instance_name, request.digest_function, action_digest)
            .map_err(Status::invalid_argument)?;

        let action_result: ActionResult = self
            .inner
            .action_cache
            .get(&digest)
            .into_proto(self.inner.max_batch_total_size_bytes)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(action_result))
    }

    #[tracing::instrument(skip_all)]
    pub async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        self.inner.check_authenticated(request.metadata()).await?;
        let request = request.into_inner();
        let instance_name = parse_instance_name(&request.instance_name)?;
        let action_digest = request
            .action_digest
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Missing action_digest"))?;
        let digest = convert_digest(&instance_name, request.digest_function, action_digest)
            .map_err(Status::invalid_argument)?;
        let action_result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("Missing action_result"))?;

        self.inner
            .action_cache
            .put(digest, Buffer::from_proto(action_result.clone()))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(action_result))
    }
}
