// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use digest::{Digest, DigestSet, InstanceName, KeyFormat};
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::access::{BlobAccess, Capabilities};
use crate::buffer::Buffer;
use crate::error::StorageError;

/// How the cache chooses a victim when it is full.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvictionPolicy {
    LeastRecentlyUsed,
    Random,
}

enum Cache {
    Lru(LruCache<String, Instant>),
    Random {
        capacity: usize,
        entries: HashMap<String, Instant>,
    },
}

impl Cache {
    fn new(policy: EvictionPolicy, capacity: NonZeroUsize) -> Self {
        match policy {
            EvictionPolicy::LeastRecentlyUsed => Cache::Lru(LruCache::new(capacity)),
            EvictionPolicy::Random => Cache::Random {
                capacity: capacity.get(),
                entries: HashMap::new(),
            },
        }
    }

    /// Whether `key` is cached with an expiry still in the future.
    fn contains_fresh(&mut self, key: &str, now: Instant) -> bool {
        match self {
            Cache::Lru(cache) => match cache.get(key) {
                Some(expiry) if *expiry > now => true,
                Some(_) => {
                    cache.pop(key);
                    false
                }
                None => false,
            },
            Cache::Random { entries, .. } => match entries.get(key) {
                Some(expiry) if *expiry > now => true,
                Some(_) => {
                    entries.remove(key);
                    false
                }
                None => false,
            },
        }
    }

    fn insert(&mut self, key: String, expiry: Instant) {
        match self {
            Cache::Lru(cache) => {
                cache.put(key, expiry);
            }
            Cache::Random { capacity, entries } => {
                if entries.len() >= *capacity && !entries.contains_key(&key) {
                    let victim = entries
                        .keys()
                        .choose(&mut rand::thread_rng())
                        .cloned()
                        .expect("cache is non-empty");
                    entries.remove(&victim);
                }
                entries.insert(key, expiry);
            }
        }
    }
}

/// Speeds up `find_missing` by remembering which digests a backend recently
/// confirmed to hold. Cached digests are assumed present until their entry
/// expires, so the TTL bounds how long an eviction on the backend can stay
/// invisible.
pub struct ExistenceCachingAccess<BA> {
    key_format: KeyFormat,
    ttl: Duration,
    cache: Arc<Mutex<Cache>>,
    underlying: BA,
}

impl<BA> ExistenceCachingAccess<BA> {
    pub fn new(
        underlying: BA,
        key_format: KeyFormat,
        max_entries: NonZeroUsize,
        ttl: Duration,
        policy: EvictionPolicy,
    ) -> Self {
        ExistenceCachingAccess {
            key_format,
            ttl,
            cache: Arc::new(Mutex::new(Cache::new(policy, max_entries))),
            underlying,
        }
    }
}

#[async_trait]
impl<BA> BlobAccess for ExistenceCachingAccess<BA>
where
    BA: BlobAccess,
{
    fn get(&self, digest: &Digest) -> Buffer {
        self.underlying.get(digest)
    }

    async fn put(&self, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.underlying.put(digest, buffer).await
    }

    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let now = Instant::now();
        let unknown_digests: DigestSet = {
            let mut cache = self.cache.lock();
            digests
                .into_iter()
                .filter(|d| !cache.contains_fresh(&d.key(self.key_format), now))
                .collect()
        };

        if unknown_digests.is_empty() {
            return Ok(DigestSet::new());
        }

        let missing_digests = self
            .underlying
            .find_missing(unknown_digests.clone())
            .await?;

        let present_digests = unknown_digests.difference(&missing_digests);
        if !present_digests.is_empty() {
            let expiry = Instant::now() + self.ttl;
            let mut cache = self.cache.lock();
            for digest in present_digests.iter() {
                cache.insert(digest.key(self.key_format), expiry);
            }
        }

        Ok(missing_digests)
    }

    async fn get_capabilities(
        &self,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.underlying.get_capabilities(instance_name).await
    }
}
