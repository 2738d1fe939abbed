// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume-scoped path → node index
//!
//! Implementations are never synchronised themselves; the volume wraps the
//! table in its single table lock and every access goes through that lock.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::file_node::FileNode;

/// Separator between path components
pub const PATH_SEPARATOR: char = '\\';

pub trait NameTable: Send {
    /// Map `key` to `node` unless an entry already exists. Returns the node
    /// now mapped to `key` and whether it is the one passed in.
    fn insert_if_absent(&mut self, key: &str, node: &Arc<FileNode>) -> (Arc<FileNode>, bool);

    fn remove(&mut self, key: &str) -> Option<Arc<FileNode>>;

    fn get(&self, key: &str) -> Option<&Arc<FileNode>>;

    /// Nodes whose key equals `key` (unless `subpath_only`) or lies below it.
    fn enumerate<'a>(
        &'a self,
        key: &str,
        subpath_only: bool,
    ) -> Box<dyn Iterator<Item = &'a Arc<FileNode>> + 'a>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Table key for `name` on a volume with the given case sensitivity
pub fn normalize_key(name: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(name.to_uppercase())
    }
}

/// Whether `candidate` lies strictly below `parent`
pub fn is_descendant(parent: &str, candidate: &str) -> bool {
    if candidate.len() <= parent.len() || !candidate.starts_with(parent) {
        return false;
    }
    parent.ends_with(PATH_SEPARATOR) || candidate[parent.len()..].starts_with(PATH_SEPARATOR)
}

/// Ordered in-memory table
#[derive(Default)]
pub struct OrderedNameTable {
    entries: BTreeMap<String, Arc<FileNode>>,
}

impl OrderedNameTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameTable for OrderedNameTable {
    fn insert_if_absent(&mut self, key: &str, node: &Arc<FileNode>) -> (Arc<FileNode>, bool) {
        if let Some(existing) = self.entries.get(key) {
            return (Arc::clone(existing), false);
        }
        self.entries.insert(key.to_owned(), Arc::clone(node));
        (Arc::clone(node), true)
    }

    fn remove(&mut self, key: &str) -> Option<Arc<FileNode>> {
        self.entries.remove(key)
    }

    fn get(&self, key: &str) -> Option<&Arc<FileNode>> {
        self.entries.get(key)
    }

    fn enumerate<'a>(
        &'a self,
        key: &str,
        subpath_only: bool,
    ) -> Box<dyn Iterator<Item = &'a Arc<FileNode>> + 'a> {
        let prefix = key.to_owned();
        let parent = key.to_owned();
        Box::new(
            self.entries
                .range::<str, _>((Bound::Included(key), Bound::Unbounded))
                .take_while(move |(k, _)| k.starts_with(prefix.as_str()))
                .filter(move |(k, _)| {
                    let exact = k.len() == parent.len();
                    (exact && !subpath_only) || is_descendant(&parent, k)
                })
                .map(|(_, node)| node),
        )
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
