// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::hash::Hash;

use crate::{Digest, DigestFunction};

/// An unordered set of digests. Iteration order is unspecified but stable for
/// the lifetime of the set, which keeps fan-out/merge logic deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DigestSet {
    // Sorted and deduplicated.
    digests: Vec<Digest>,
}

impl DigestSet {
    pub fn new() -> Self {
        DigestSet {
            digests: Vec::new(),
        }
    }

    pub fn single(digest: Digest) -> Self {
        DigestSet {
            digests: vec![digest],
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.binary_search(digest).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.digests.iter()
    }

    pub fn union(mut self, other: DigestSet) -> DigestSet {
        self.digests.extend(other.digests);
        self.digests.sort();
        self.digests.dedup();
        self
    }

    pub fn intersection(&self, other: &DigestSet) -> DigestSet {
        DigestSet {
            digests: self
                .digests
                .iter()
                .filter(|d| other.contains(d))
                .cloned()
                .collect(),
        }
    }

    /// The digests in `self` that are not in `other`.
    pub fn difference(&self, other: &DigestSet) -> DigestSet {
        DigestSet {
            digests: self
                .digests
                .iter()
                .filter(|d| !other.contains(d))
                .cloned()
                .collect(),
        }
    }

    /// Group the set by a caller-supplied routing key. Each subset preserves
    /// the parent's ordering invariants.
    pub fn partition_by<K, F>(&self, key_fn: F) -> HashMap<K, DigestSet>
    where
        K: Hash + Eq,
        F: Fn(&Digest) -> K,
    {
        let mut partitions: HashMap<K, DigestSet> = HashMap::new();
        for digest in &self.digests {
            partitions
                .entry(key_fn(digest))
                .or_default()
                .digests
                .push(digest.clone());
        }
        partitions
    }

    pub fn partition_by_function(&self) -> HashMap<DigestFunction, DigestSet> {
        self.partition_by(|d| d.digest_function())
    }

    /// Group by a fallible routing key; the first key error aborts.
    pub fn try_partition_by<K, F, E>(&self, key_fn: F) -> Result<HashMap<K, DigestSet>, E>
    where
        K: Hash + Eq,
        F: Fn(&Digest) -> Result<K, E>,
    {
        let mut partitions: HashMap<K, DigestSet> = HashMap::new();
        for digest in &self.digests {
            partitions
                .entry(key_fn(digest)?)
                .or_default()
                .digests
                .push(digest.clone());
        }
        Ok(partitions)
    }

    pub fn map<F>(&self, f: F) -> DigestSet
    where
        F: Fn(&Digest) -> Digest,
    {
        self.digests.iter().map(f).collect()
    }
}

impl FromIterator<Digest> for DigestSet {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        let mut digests: Vec<Digest> = iter.into_iter().collect();
        digests.sort();
        digests.dedup();
        DigestSet { digests }
    }
}

impl IntoIterator for DigestSet {
    type Item = Digest;
    type IntoIter = std::vec::IntoIter<Digest>;

    fn into_iter(self) -> Self::IntoIter {
        self.digests.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::DigestSet;
    use crate::{Digest, DigestFunction, InstanceName};

    fn digest_of(content: &[u8], function: DigestFunction) -> Digest {
        Digest::of_bytes(InstanceName::new("main").unwrap(), function, content)
    }

    #[test]
    fn deduplicates() {
        let d = digest_of(b"foobar", DigestFunction::Sha256);
        let set: DigestSet = vec![d.clone(), d.clone(), d.clone()].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&d));
    }

    #[test]
    fn partitions_by_function() {
        let d1 = digest_of(b"a", DigestFunction::Md5);
        let d2 = digest_of(b"b", DigestFunction::Md5);
        let d3 = digest_of(b"c", DigestFunction::Sha256);
        let set: DigestSet = vec![d1.clone(), d2.clone(), d3.clone()]
            .into_iter()
            .collect();

        let partitions = set.partition_by_function();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[&DigestFunction::Md5].len(), 2);
        assert_eq!(partitions[&DigestFunction::Sha256].len(), 1);
        assert!(partitions[&DigestFunction::Sha256].contains(&d3));
    }

    #[test]
    fn union_and_intersection() {
        let d1 = digest_of(b"a", DigestFunction::Sha256);
        let d2 = digest_of(b"b", DigestFunction::Sha256);
        let d3 = digest_of(b"c", DigestFunction::Sha256);

        let left: DigestSet = vec![d1.clone(), d2.clone()].into_iter().collect();
        let right: DigestSet = vec![d2.clone(), d3.clone()].into_iter().collect();

        let both = left.clone().union(right.clone());
        assert_eq!(both.len(), 3);

        let shared = left.intersection(&right);
        assert_eq!(shared.len(), 1);
        assert!(shared.contains(&d2));
    }
}
