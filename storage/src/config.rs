// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The in-process configuration value that drives the core: a recursive
//! description of the storage tree and the replication engines, assembled
//! into live `BlobAccess`/`Replicator` graphs. Parsing the value from a
//! config file format is the embedding process's concern.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use digest::{InstanceName, KeyFormat};
use serde::Deserialize;

use crate::access::{
    BlobAccess, DeadlineEnforcingAccess, DemultiplexedBackend, DemultiplexingAccess,
    EvictionPolicy, ExistenceCachingAccess, MemoryAccess, MetricsMonitoredAccess, MirroredAccess,
    ReadCachingAccess, ReadPolicy, RetryPolicy, RetryingAccess, Shard, ShardingAccess,
    SizeSplitAccess, UpdateGatingAccess,
};
use crate::replicator::{
    ConcurrencyLimitedReplicator, DeduplicatingReplicator, LocalReplicator, QueuedReplicator,
    Replicator,
};

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormatConfig {
    WithInstance,
    WithoutInstance,
}

impl From<KeyFormatConfig> for KeyFormat {
    fn from(config: KeyFormatConfig) -> Self {
        match config {
            KeyFormatConfig::WithInstance => KeyFormat::WithInstance,
            KeyFormatConfig::WithoutInstance => KeyFormat::WithoutInstance,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyConfig {
    LeastRecentlyUsed,
    Random,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicyConfig {
    RoundRobin,
    ConsistentHash,
    PrimaryWithFallback,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    pub key_format: KeyFormatConfig,
    /// Whether reads are verified against the digest (content-addressed
    /// stores) or served as-is (indexed stores such as the Action Cache).
    pub content_addressed: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeadlineConfig {
    pub timeout: Duration,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExistenceCacheConfig {
    pub max_entries: NonZeroUsize,
    pub ttl: Duration,
    pub eviction_policy: EvictionPolicyConfig,
    pub key_format: KeyFormatConfig,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReadCacheConfig {
    pub fast: Box<BlobAccessConfig>,
    pub slow: Box<BlobAccessConfig>,
    pub max_replication_size_bytes: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SizeSplitConfig {
    /// Blobs smaller than this size go to `small`, the rest to `large`.
    pub size_bytes: usize,
    pub small: Box<BlobAccessConfig>,
    pub large: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpdateGateConfig {
    pub allowed_instance_name_prefixes: Vec<String>,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    pub driver_label: String,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteConfig {
    /// Instance-name prefix owning this route.
    pub prefix: String,
    /// Optional replacement for the matched prefix before the call reaches
    /// the backend.
    pub instance_name_patcher: Option<String>,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DemultiplexingConfig {
    pub routes: Vec<RouteConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MirroredConfig {
    pub backend_a: Box<BlobAccessConfig>,
    pub backend_b: Box<BlobAccessConfig>,
    pub read_policy: ReadPolicyConfig,
    pub max_put_clone_size_bytes: usize,
    /// Engine used to repair divergence, wrapped around a local replicator
    /// between the two backends.
    pub replicator: ReplicatorConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShardConfig {
    pub key: String,
    pub weight: u32,
    pub backend: Box<BlobAccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShardedConfig {
    pub shards: Vec<ShardConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobAccessConfig {
    Memory(MemoryConfig),
    Deadline(DeadlineConfig),
    ExistenceCache(ExistenceCacheConfig),
    ReadCache(ReadCacheConfig),
    SizeSplit(SizeSplitConfig),
    UpdateGate(UpdateGateConfig),
    Metrics(MetricsConfig),
    Retry(RetryConfig),
    Demultiplexing(DemultiplexingConfig),
    Mirrored(Box<MirroredConfig>),
    Sharded(ShardedConfig),
}

/// Coordination layers stacked on top of the local replicator between a
/// mirrored pair.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorConfig {
    Local,
    Queued {
        queue_capacity: usize,
        worker_count: usize,
        inner: Box<ReplicatorConfig>,
    },
    Deduplicating {
        key_format: KeyFormatConfig,
        success_ttl: Duration,
        inner: Box<ReplicatorConfig>,
    },
    ConcurrencyLimited {
        max_concurrency: usize,
        inner: Box<ReplicatorConfig>,
    },
}

/// Build a replicator between a fixed source/sink pair.
///
/// Must run within a Tokio runtime: queued engines spawn their worker pool
/// at construction time.
pub fn build_replicator(
    config: &ReplicatorConfig,
    source: Arc<dyn BlobAccess>,
    sink: Arc<dyn BlobAccess>,
) -> Arc<dyn Replicator> {
    match config {
        ReplicatorConfig::Local => Arc::new(LocalReplicator::new(source, sink)),
        ReplicatorConfig::Queued {
            queue_capacity,
            worker_count,
            inner,
        } => Arc::new(QueuedReplicator::new(
            build_replicator(inner, source, sink),
            *queue_capacity,
            *worker_count,
        )),
        ReplicatorConfig::Deduplicating {
            key_format,
            success_ttl,
            inner,
        } => Arc::new(DeduplicatingReplicator::new(
            build_replicator(inner, source, sink),
            (*key_format).into(),
            *success_ttl,
        )),
        ReplicatorConfig::ConcurrencyLimited {
            max_concurrency,
            inner,
        } => Arc::new(ConcurrencyLimitedReplicator::new(
            build_replicator(inner, source, sink),
            *max_concurrency,
        )),
    }
}

/// Assemble a storage tree from its configuration.
pub fn build_blob_access(config: &BlobAccessConfig) -> Result<Arc<dyn BlobAccess>, String> {
    match config {
        BlobAccessConfig::Memory(memory) => {
            let key_format = memory.key_format.into();
            Ok(if memory.content_addressed {
                Arc::new(MemoryAccess::content_addressed(key_format))
            } else {
                Arc::new(MemoryAccess::indexed(key_format))
            })
        }
        BlobAccessConfig::Deadline(deadline) => Ok(Arc::new(DeadlineEnforcingAccess::new(
            build_blob_access(&deadline.backend)?,
            deadline.timeout,
        ))),
        BlobAccessConfig::ExistenceCache(cache) => Ok(Arc::new(ExistenceCachingAccess::new(
            build_blob_access(&cache.backend)?,
            cache.key_format.into(),
            cache.max_entries,
            cache.ttl,
            match cache.eviction_policy {
                EvictionPolicyConfig::LeastRecentlyUsed => EvictionPolicy::LeastRecentlyUsed,
                EvictionPolicyConfig::Random => EvictionPolicy::Random,
            },
        ))),
        BlobAccessConfig::ReadCache(read_cache) => Ok(Arc::new(ReadCachingAccess::new(
            build_blob_access(&read_cache.fast)?,
            build_blob_access(&read_cache.slow)?,
            read_cache.max_replication_size_bytes,
        ))),
        BlobAccessConfig::SizeSplit(size_split) => Ok(Arc::new(SizeSplitAccess::new(
            size_split.size_bytes,
            build_blob_access(&size_split.small)?,
            build_blob_access(&size_split.large)?,
        ))),
        BlobAccessConfig::UpdateGate(gate) => {
            let prefixes = gate
                .allowed_instance_name_prefixes
                .iter()
                .map(|p| InstanceName::new(p.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(UpdateGatingAccess::new(
                build_blob_access(&gate.backend)?,
                &prefixes,
            )))
        }
        BlobAccessConfig::Metrics(metrics) => Ok(Arc::new(MetricsMonitoredAccess::new(
            build_blob_access(&metrics.backend)?,
            // Metric labels live for the process lifetime.
            Box::leak(metrics.driver_label.clone().into_boxed_str()),
        ))),
        BlobAccessConfig::Retry(retry) => Ok(Arc::new(RetryingAccess::new(
            build_blob_access(&retry.backend)?,
            RetryPolicy {
                max_attempts: retry.max_attempts,
                base_delay: retry.base_delay,
                max_delay: retry.max_delay,
            },
        ))),
        BlobAccessConfig::Demultiplexing(demux) => {
            let backends = demux
                .routes
                .iter()
                .map(|route| {
                    Ok(DemultiplexedBackend {
                        prefix: InstanceName::new(route.prefix.clone())?,
                        backend: build_blob_access(&route.backend)?,
                        instance_name_patcher: route
                            .instance_name_patcher
                            .as_ref()
                            .map(|p| InstanceName::new(p.clone()))
                            .transpose()?,
                    })
                })
                .collect::<Result<Vec<_>, String>>()?;
            Ok(Arc::new(DemultiplexingAccess::new(backends)))
        }
        BlobAccessConfig::Mirrored(mirrored) => {
            let backend_a = build_blob_access(&mirrored.backend_a)?;
            let backend_b = build_blob_access(&mirrored.backend_b)?;
            let replicator_a_to_b = build_replicator(
                &mirrored.replicator,
                backend_a.clone(),
                backend_b.clone(),
            );
            let replicator_b_to_a = build_replicator(
                &mirrored.replicator,
                backend_b.clone(),
                backend_a.clone(),
            );
            Ok(Arc::new(MirroredAccess::new(
                backend_a,
                backend_b,
                replicator_a_to_b,
                replicator_b_to_a,
                match mirrored.read_policy {
                    ReadPolicyConfig::RoundRobin => ReadPolicy::RoundRobin,
                    ReadPolicyConfig::ConsistentHash => ReadPolicy::ConsistentHash,
                    ReadPolicyConfig::PrimaryWithFallback => ReadPolicy::PrimaryWithFallback,
                },
                mirrored.max_put_clone_size_bytes,
            )))
        }
        BlobAccessConfig::Sharded(sharded) => {
            let shards = sharded
                .shards
                .iter()
                .map(|shard| {
                    Ok(Shard {
                        key: shard.key.clone(),
                        weight: shard.weight,
                        backend: build_blob_access(&shard.backend)?,
                    })
                })
                .collect::<Result<Vec<_>, String>>()?;
            if shards.is_empty() {
                return Err("Sharded storage requires at least one shard".to_owned());
            }
            Ok(Arc::new(ShardingAccess::new(shards)))
        }
    }
}

/// Top-level configuration of the storage front end.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub cas: BlobAccessConfig,
    pub action_cache: BlobAccessConfig,
    pub indirect_cas: BlobAccessConfig,
    /// Instance-name prefixes whose Action Cache writes are permitted.
    pub allowed_action_cache_update_prefixes: Vec<String>,
    pub max_batch_total_size_bytes: usize,
}
