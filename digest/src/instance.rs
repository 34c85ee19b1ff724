// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;

/// Path components that the Remote Execution API reserves for its resource
/// grammar. Instance names may not use them.
const RESERVED_KEYWORDS: [&str; 5] = [
    "blobs",
    "uploads",
    "compressed-blobs",
    "operations",
    "capabilities",
];

/// A validated slash-separated tenant/scope label. The empty string is the
/// root instance.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() {
            return Ok(InstanceName(name));
        }
        for component in name.split('/') {
            if component.is_empty() {
                return Err(format!(
                    "Instance name {name:?} contains an empty path component"
                ));
            }
            if RESERVED_KEYWORDS.contains(&component) {
                return Err(format!(
                    "Instance name {name:?} contains the reserved keyword {component:?}"
                ));
            }
        }
        Ok(InstanceName(name))
    }

    /// The root (empty) instance name.
    pub fn root() -> Self {
        InstanceName(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Whether `prefix` is a component-wise prefix of this name. The root
    /// instance is a prefix of every name.
    pub fn has_prefix(&self, prefix: &InstanceName) -> bool {
        let mut own = self.components();
        for wanted in prefix.components() {
            if own.next() != Some(wanted) {
                return false;
            }
        }
        true
    }

    /// Rewrite a leading `old` prefix to `new`, e.g. when forwarding traffic
    /// to a backend that uses a different tenant label. Returns `None` when
    /// `old` is not a prefix of this name.
    pub fn with_prefix_replaced(
        &self,
        old: &InstanceName,
        new: &InstanceName,
    ) -> Option<InstanceName> {
        if !self.has_prefix(old) {
            return None;
        }
        let suffix: Vec<&str> = self.components().skip(old.components().count()).collect();
        let mut parts: Vec<&str> = new.components().collect();
        parts.extend(suffix);
        Some(InstanceName(parts.join("/")))
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct TrieNode {
    tag: Option<usize>,
    children: HashMap<String, TrieNode>,
}

/// Maps instance-name prefixes to opaque tags, answering longest-prefix
/// queries without per-request string scanning of the full routing table.
#[derive(Default)]
pub struct InstanceNameTrie {
    root: TrieNode,
}

impl InstanceNameTrie {
    pub fn new() -> Self {
        InstanceNameTrie {
            root: TrieNode::default(),
        }
    }

    /// Associate `tag` with `prefix`, replacing any previous tag.
    pub fn set(&mut self, prefix: &InstanceName, tag: usize) {
        let mut node = &mut self.root;
        for component in prefix.components() {
            node = node.children.entry(component.to_owned()).or_default();
        }
        node.tag = Some(tag);
    }

    /// Return the tag of the longest registered prefix of `name`.
    pub fn lookup_longest(&self, name: &InstanceName) -> Option<usize> {
        let mut node = &self.root;
        let mut best = node.tag;
        for component in name.components() {
            match node.children.get(component) {
                Some(child) => {
                    node = child;
                    if node.tag.is_some() {
                        best = node.tag;
                    }
                }
                None => break,
            }
        }
        best
    }

    /// Whether any registered prefix covers `name`.
    pub fn contains(&self, name: &InstanceName) -> bool {
        self.lookup_longest(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{InstanceName, InstanceNameTrie};

    #[test]
    fn validation() {
        InstanceName::new("").unwrap();
        InstanceName::new("main").unwrap();
        InstanceName::new("acme/ci/linux").unwrap();

        InstanceName::new("acme//ci").unwrap_err();
        InstanceName::new("/acme").unwrap_err();
        InstanceName::new("acme/").unwrap_err();
        InstanceName::new("blobs").unwrap_err();
        InstanceName::new("acme/uploads/ci").unwrap_err();
        InstanceName::new("acme/compressed-blobs").unwrap_err();
        InstanceName::new("operations").unwrap_err();
    }

    #[test]
    fn prefixes() {
        let name = InstanceName::new("acme/ci/linux").unwrap();
        assert!(name.has_prefix(&InstanceName::root()));
        assert!(name.has_prefix(&InstanceName::new("acme").unwrap()));
        assert!(name.has_prefix(&InstanceName::new("acme/ci").unwrap()));
        assert!(name.has_prefix(&name));
        assert!(!name.has_prefix(&InstanceName::new("acme/release").unwrap()));
        assert!(!name.has_prefix(&InstanceName::new("ci").unwrap()));
    }

    #[test]
    fn prefix_replacement() {
        let name = InstanceName::new("acme/ci/linux").unwrap();
        let rewritten = name
            .with_prefix_replaced(
                &InstanceName::new("acme").unwrap(),
                &InstanceName::new("tenant42").unwrap(),
            )
            .unwrap();
        assert_eq!(rewritten.as_str(), "tenant42/ci/linux");

        // Replacing with the root prefix strips the label.
        let stripped = name
            .with_prefix_replaced(&InstanceName::new("acme/ci").unwrap(), &InstanceName::root())
            .unwrap();
        assert_eq!(stripped.as_str(), "linux");

        assert!(name
            .with_prefix_replaced(
                &InstanceName::new("other").unwrap(),
                &InstanceName::root()
            )
            .is_none());
    }

    #[test]
    fn trie_longest_prefix() {
        let mut trie = InstanceNameTrie::new();
        trie.set(&InstanceName::new("acme").unwrap(), 1);
        trie.set(&InstanceName::new("acme/ci").unwrap(), 2);
        trie.set(&InstanceName::root(), 0);

        assert_eq!(trie.lookup_longest(&InstanceName::root()), Some(0));
        assert_eq!(
            trie.lookup_longest(&InstanceName::new("other").unwrap()),
            Some(0)
        );
        assert_eq!(
            trie.lookup_longest(&InstanceName::new("acme/release").unwrap()),
            Some(1)
        );
        assert_eq!(
            trie.lookup_longest(&InstanceName::new("acme/ci/linux").unwrap()),
            Some(2)
        );

        let mut no_root = InstanceNameTrie::new();
        no_root.set(&InstanceName::new("acme").unwrap(), 7);
        assert_eq!(no_root.lookup_longest(&InstanceName::root()), None);
        assert!(!no_root.contains(&InstanceName::new("other").unwrap()));
        assert!(no_root.contains(&InstanceName::new("acme/ci").unwrap()));
    }
}
