//! Builds the content-addressed tree of a single version state.
//!
//! Nodes live in an arena and address each other by index; index 0 is the
//! root directory. File digests come from the inventory, directory digests
//! are SHA-256 over the sorted list of children, so identical subtrees get
//! identical digests regardless of which object or version they occur in.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::digests::Digest;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid digest {digest:?} for {path}")]
    InvalidDigest { path: String, digest: String },

    #[error("no size known for content path {0}")]
    MissingSize(String),

    #[error("invalid logical path: {0:?}")]
    InvalidPath(String),

    #[error("logical path conflicts with existing entry: {0}")]
    PathConflict(String),

    #[error("size overflow in directory {0:?}")]
    SizeOverflow(String),
}

/// One logical path of a version state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    pub logical_path: String,
    /// hex encoded, as found in the inventory
    pub digest: String,
    /// path of the stored content, relative to the object root
    pub content_path: String,
}

/// The computed value of a tree node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexingVal {
    pub digest: Digest,
    /// content path for files, empty for directories
    pub source_path: String,
    pub size: u64,
    pub has_size: bool,
}

impl IndexingVal {
    pub fn size(&self) -> Option<u64> {
        self.has_size.then_some(self.size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub is_dir: bool,
    /// child name → arena index, kept sorted by name
    pub children: BTreeMap<String, usize>,
    pub val: IndexingVal,
}

impl TreeNode {
    fn dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_dir: true,
            children: BTreeMap::new(),
            val: IndexingVal::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTree {
    nodes: Vec<TreeNode>,
}

impl PathTree {
    pub const ROOT: usize = 0;

    /// Builds the tree for the given leaves. When `sizes` is given, every
    /// leaf's content path must be present in it.
    pub fn build<'a, I>(entries: I, sizes: Option<&HashMap<String, u64>>) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a LeafEntry>,
    {
        let mut tree = PathTree {
            nodes: vec![TreeNode::dir("")],
        };
        for entry in entries {
            tree.insert(entry, sizes)?;
        }
        tree.compute_dirs()?;
        Ok(tree)
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    /// Looks up a node by its slash-separated logical path.
    pub fn get(&self, path: &str) -> Option<usize> {
        let mut idx = Self::ROOT;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            idx = *self.nodes[idx].children.get(segment)?;
        }
        Some(idx)
    }

    /// Iterates over all files, yielding their arena index.
    pub fn files(&self) -> impl Iterator<Item = (usize, &TreeNode)> {
        self.nodes.iter().enumerate().filter(|(_, n)| !n.is_dir)
    }

    fn insert(&mut self, entry: &LeafEntry, sizes: Option<&HashMap<String, u64>>) -> Result<(), Error> {
        let path = &entry.logical_path;
        let segments: Vec<&str> = path.split('/').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(Error::InvalidPath(path.clone()));
        }

        let digest = Digest::from_hex(&entry.digest).map_err(|_| Error::InvalidDigest {
            path: path.clone(),
            digest: entry.digest.clone(),
        })?;
        let (size, has_size) = match sizes {
            None => (0, false),
            Some(sizes) => match sizes.get(&entry.content_path) {
                Some(size) => (*size, true),
                None => return Err(Error::MissingSize(entry.content_path.clone())),
            },
        };

        let (file_name, dirs) = segments
            .split_last()
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        let mut parent = Self::ROOT;
        for dir in dirs {
            parent = match self.nodes[parent].children.get(*dir) {
                Some(&idx) if self.nodes[idx].is_dir => idx,
                Some(_) => return Err(Error::PathConflict(path.clone())),
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(TreeNode::dir(dir));
                    self.nodes[parent].children.insert(dir.to_string(), idx);
                    idx
                }
            };
        }

        if self.nodes[parent].children.contains_key(*file_name) {
            return Err(Error::PathConflict(path.clone()));
        }
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            name: file_name.to_string(),
            is_dir: false,
            children: BTreeMap::new(),
            val: IndexingVal {
                digest,
                source_path: entry.content_path.clone(),
                size,
                has_size,
            },
        });
        self.nodes[parent].children.insert(file_name.to_string(), idx);
        Ok(())
    }

    /// Computes digest and size of every directory, children first.
    fn compute_dirs(&mut self) -> Result<(), Error> {
        for idx in self.post_order() {
            if !self.nodes[idx].is_dir {
                continue;
            }

            let mut hasher = Sha256::new();
            let mut size: Option<u64> = Some(0);
            for (name, &child) in &self.nodes[idx].children {
                let child = &self.nodes[child];
                hasher.update(child.val.digest.to_hex().as_bytes());
                hasher.update(b" ");
                hasher.update(name.as_bytes());
                if child.is_dir {
                    hasher.update(b"/");
                }
                hasher.update(b"\n");

                size = match (size, child.val.size()) {
                    (Some(acc), Some(s)) => Some(
                        acc.checked_add(s)
                            .ok_or_else(|| Error::SizeOverflow(self.nodes[idx].name.clone()))?,
                    ),
                    _ => None,
                };
            }

            let val = &mut self.nodes[idx].val;
            val.digest = hasher.finalize().to_vec().into();
            val.size = size.unwrap_or(0);
            val.has_size = size.is_some();
        }
        Ok(())
    }

    /// Arena indices in post-order: every child before its parent.
    fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(Self::ROOT, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                order.push(idx);
                continue;
            }
            stack.push((idx, true));
            for &child in self.nodes[idx].children.values().rev() {
                stack.push((child, false));
            }
        }
        order
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::{Error, LeafEntry, PathTree};
    use crate::digests::DigestAlgorithm;

    fn leaf(logical: &str, content: &[u8], content_path: &str) -> LeafEntry {
        LeafEntry {
            logical_path: logical.to_string(),
            digest: DigestAlgorithm::Sha512.hash(content).to_hex(),
            content_path: content_path.to_string(),
        }
    }

    fn sizes(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(p, s)| (p.to_string(), *s)).collect()
    }

    #[test]
    fn scenario_sizes_propagate() {
        let entries = vec![
            leaf("a.txt", b"hello", "v1/content/a.txt"),
            leaf("b/c.txt", b"goodbye", "v1/content/b/c.txt"),
        ];
        let sizes = sizes(&[("v1/content/a.txt", 5), ("v1/content/b/c.txt", 7)]);
        let tree = PathTree::build(&entries, Some(&sizes)).expect("must build");

        let a = tree.node(tree.get("a.txt").unwrap());
        assert_eq!(Some(5), a.val.size());
        assert_eq!(DigestAlgorithm::Sha512.hash(b"hello"), a.val.digest);

        let b = tree.node(tree.get("b").unwrap());
        assert!(b.is_dir);
        assert_eq!(Some(7), b.val.size());

        assert_eq!(Some(12), tree.root().val.size());
        assert_eq!(4, tree.len());
    }

    #[test]
    fn directory_digest_format() {
        let entries = vec![
            leaf("a.txt", b"hello", "v1/content/a.txt"),
            leaf("b/c.txt", b"goodbye", "v1/content/b/c.txt"),
        ];
        let tree = PathTree::build(&entries, None).unwrap();

        let c_hex = DigestAlgorithm::Sha512.hash(b"goodbye").to_hex();
        let b_digest = DigestAlgorithm::Sha256.hash(format!("{} c.txt\n", c_hex).as_bytes());
        assert_eq!(b_digest, tree.node(tree.get("b").unwrap()).val.digest);

        let a_hex = DigestAlgorithm::Sha512.hash(b"hello").to_hex();
        let root = DigestAlgorithm::Sha256
            .hash(format!("{} a.txt\n{} b/\n", a_hex, b_digest.to_hex()).as_bytes());
        assert_eq!(root, tree.root().val.digest);
    }

    #[test]
    fn unknown_sizes_are_not_approximated() {
        let entries = vec![leaf("x/one", b"1", "v1/content/x/one")];
        let tree = PathTree::build(&entries, None).unwrap();
        assert_eq!(None, tree.root().val.size());
        assert_eq!(None, tree.node(tree.get("x").unwrap()).val.size());
    }

    #[test]
    fn entry_order_does_not_matter() {
        let mut entries = vec![
            leaf("a/1", b"1", "v1/content/a/1"),
            leaf("a/2", b"2", "v1/content/a/2"),
            leaf("b", b"3", "v1/content/b"),
            leaf("c/d/e", b"4", "v1/content/c/d/e"),
        ];
        let forward = PathTree::build(&entries, None).unwrap();
        entries.reverse();
        let backward = PathTree::build(&entries, None).unwrap();
        assert_eq!(forward.root().val.digest, backward.root().val.digest);
    }

    #[test]
    fn identical_subtrees_share_digest() {
        let entries = vec![
            leaf("x/f", b"same", "v1/content/x/f"),
            leaf("y/f", b"same", "v1/content/y/f"),
        ];
        let tree = PathTree::build(&entries, None).unwrap();
        assert_eq!(
            tree.node(tree.get("x").unwrap()).val.digest,
            tree.node(tree.get("y").unwrap()).val.digest
        );
    }

    #[test]
    fn empty_state() {
        let tree = PathTree::build(&[], Some(&HashMap::new())).unwrap();
        assert!(tree.is_empty());
        assert_eq!(Some(0), tree.root().val.size());
        assert_eq!(DigestAlgorithm::Sha256.hash(b""), tree.root().val.digest);
    }

    #[test]
    fn missing_size() {
        let entries = vec![leaf("a", b"a", "v1/content/a")];
        assert_eq!(
            Err(Error::MissingSize("v1/content/a".to_string())),
            PathTree::build(&entries, Some(&HashMap::new()))
        );
    }

    #[test]
    fn bad_digest() {
        let entries = vec![LeafEntry {
            logical_path: "a".to_string(),
            digest: "not-hex".to_string(),
            content_path: "v1/content/a".to_string(),
        }];
        assert!(matches!(
            PathTree::build(&entries, None),
            Err(Error::InvalidDigest { .. })
        ));
    }

    #[test]
    fn invalid_paths() {
        for p in ["", "a//b", "./a", "a/..", "/a"] {
            let entries = vec![leaf(p, b"a", "v1/content/a")];
            assert_eq!(
                Err(Error::InvalidPath(p.to_string())),
                PathTree::build(&entries, None),
                "{p:?} must be rejected"
            );
        }
    }

    #[test]
    fn file_dir_conflict() {
        let entries = vec![
            leaf("a", b"a", "v1/content/a"),
            leaf("a/b", b"b", "v1/content/a/b"),
        ];
        assert_eq!(
            Err(Error::PathConflict("a/b".to_string())),
            PathTree::build(&entries, None)
        );
    }
}
