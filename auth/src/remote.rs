// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tonic::Status;

use crate::{AuthError, AuthenticationMetadata, Authenticator, RequestContext};

/// Transport boundary for the remote authentication RPC.
#[async_trait]
pub trait RemoteAuthClient: Send + Sync + 'static {
    /// Evaluate the forwarded request headers. An `unauthenticated` status
    /// is a verdict; any other error is a service fault.
    async fn check(
        &self,
        headers: &[(String, String)],
    ) -> Result<AuthenticationMetadata, Status>;
}

type CachedVerdict = Result<AuthenticationMetadata, String>;

/// Forwards selected request headers to a remote authentication service and
/// caches the verdict under the header tuple. Both grants and denials are
/// cached, so a misbehaving client cannot hammer the remote service.
pub struct RemoteAuthenticator<C> {
    client: C,
    header_keys: Vec<String>,
    ttl: Duration,
    cache: Mutex<LruCache<Vec<(String, String)>, (CachedVerdict, Instant)>>,
}

impl<C> RemoteAuthenticator<C>
where
    C: RemoteAuthClient,
{
    pub fn new(
        client: C,
        header_keys: Vec<String>,
        max_cache_entries: NonZeroUsize,
        ttl: Duration,
    ) -> Self {
        RemoteAuthenticator {
            client,
            header_keys,
            ttl,
            cache: Mutex::new(LruCache::new(max_cache_entries)),
        }
    }

    fn selected_headers(&self, context: &RequestContext<'_>) -> Vec<(String, String)> {
        self.header_keys
            .iter()
            .filter_map(|key| {
                context
                    .metadata
                    .get(key.as_str())
                    .and_then(|value| value.to_str().ok())
                    .map(|value| (key.clone(), value.to_owned()))
            })
            .collect()
    }
}

fn verdict_to_result(verdict: CachedVerdict) -> Result<AuthenticationMetadata, AuthError> {
    verdict.map_err(AuthError::Unauthenticated)
}

#[async_trait]
impl<C> Authenticator for RemoteAuthenticator<C>
where
    C: RemoteAuthClient,
{
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let headers = self.selected_headers(context);

        {
            let mut cache = self.cache.lock();
            match cache.get(&headers) {
                Some((verdict, cached_at)) if cached_at.elapsed() <= self.ttl => {
                    return verdict_to_result(verdict.clone());
                }
                Some(_) => {
                    cache.pop(&headers);
                }
                None => {}
            }
        }

        // No I/O is performed under the cache lock.
        let verdict: CachedVerdict = match self.client.check(&headers).await {
            Ok(metadata) => Ok(metadata),
            Err(status) if status.code() == tonic::Code::Unauthenticated => {
                Err(status.message().to_owned())
            }
            Err(status) => {
                return Err(AuthError::Internal(format!(
                    "Remote authentication service failed: {status}"
                )))
            }
        };

        self.cache
            .lock()
            .put(headers, (verdict.clone(), Instant::now()));
        verdict_to_result(verdict)
    }
}
