// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

pub type JWKSet = biscuit::jwk::JWKSet<biscuit::Empty>;

pub fn deserialize_jwk_set(json: &str) -> Result<JWKSet, serde_json::Error> {
    serde_json::from_str(json)
}

/// Source of the JSON Web Key Set used to validate token signatures.
pub trait KeySetProvider: Send + Sync + 'static {
    /// The currently held key set, or `None` when no usable set is
    /// available (never fetched, or stale beyond the configured TTL).
    fn key_set(&self) -> Option<JWKSet>;
}

/// A key set configured inline.
pub struct StaticJwks {
    key_set: JWKSet,
}

impl StaticJwks {
    pub fn new(key_set: JWKSet) -> Self {
        StaticJwks { key_set }
    }
}

impl KeySetProvider for StaticJwks {
    fn key_set(&self) -> Option<JWKSet> {
        Some(self.key_set.clone())
    }
}

struct KeySetState {
    key_set: Option<JWKSet>,
    refreshed_at: Option<Instant>,
}

/// A key set refreshed from a remote URL on a schedule.
///
/// A failed refresh keeps serving the previously fetched set until
/// `stale_ttl` elapses, so a transient outage of the issuer does not take
/// authentication down with it. Once the held set goes stale, token
/// validation fails until a refresh succeeds again.
pub struct RemoteJwks {
    state: Arc<ArcSwap<KeySetState>>,
    stale_ttl: Duration,
    refresher: tokio::task::JoinHandle<()>,
}

impl RemoteJwks {
    /// Must be called from within a Tokio runtime; the refresh task starts
    /// immediately and lives until this value is dropped.
    pub fn spawn(url: String, refresh_interval: Duration, stale_ttl: Duration) -> Self {
        let state = Arc::new(ArcSwap::from_pointee(KeySetState {
            key_set: None,
            refreshed_at: None,
        }));

        let task_state = state.clone();
        let refresher = tokio::spawn(async move {
            loop {
                match fetch_key_set(&url).await {
                    Ok(key_set) => {
                        task_state.store(Arc::new(KeySetState {
                            key_set: Some(key_set),
                            refreshed_at: Some(Instant::now()),
                        }));
                    }
                    Err(err) => {
                        log::warn!("JWKS refresh from {url} failed: {err}");
                        metrics::counter!("casgrid_auth_jwks_refresh_failures_total", 1);
                    }
                }
                tokio::time::sleep(refresh_interval).await;
            }
        });

        RemoteJwks {
            state,
            stale_ttl,
            refresher,
        }
    }
}

impl Drop for RemoteJwks {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

impl KeySetProvider for RemoteJwks {
    fn key_set(&self) -> Option<JWKSet> {
        let state = self.state.load();
        match (&state.key_set, state.refreshed_at) {
            (Some(key_set), Some(refreshed_at)) if refreshed_at.elapsed() <= self.stale_ttl => {
                Some(key_set.clone())
            }
            _ => None,
        }
    }
}

async fn fetch_key_set(url: &str) -> Result<JWKSet, String> {
    let response = reqwest::get(url)
        .await
        .map_err(|err| format!("request failed: {err}"))?
        .error_for_status()
        .map_err(|err| format!("request failed: {err}"))?;
    let body = response
        .text()
        .await
        .map_err(|err| format!("body read failed: {err}"))?;
    deserialize_jwk_set(&body).map_err(|err| format!("malformed key set: {err}"))
}
