// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume-wide node registry: the name table, its lock, and the handle
//! lifecycle (open, cleanup, close, rename).
//!
//! Every mutation of the table and of a node's open/handle counts happens
//! under the single table lock. Node references removed from the table are
//! dropped only after that lock is released, so node teardown (which calls
//! into the cache engine and the security cache) never runs under it.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::cache::CacheEngine;
use crate::config::VolumeConfig;
use crate::error::{FsError, FsResult};
use crate::file_desc::{FileDesc, FileObject};
use crate::file_node::{FileNode, NodeParams};
use crate::live::LiveGuard;
use crate::meta_cache::{MemMetaCache, MetaCache};
use crate::name_table::{normalize_key, NameTable, OrderedNameTable};
use crate::share_access::ShareReservation;
use crate::{GrantedAccess, NodeId, ShareMode};

pub struct Volume {
    config: VolumeConfig,
    table: Mutex<Box<dyn NameTable>>,
    cache: Arc<dyn CacheEngine>,
    security_cache: Arc<dyn MetaCache>,
    next_node_id: AtomicU64,
    live_nodes: Arc<AtomicUsize>,
    live_descs: Arc<AtomicUsize>,
}

impl Volume {
    /// Volume over an in-memory name table and security cache sized from
    /// `config`.
    pub fn new(config: VolumeConfig, cache: Arc<dyn CacheEngine>) -> FsResult<Self> {
        let security_cache = Arc::new(MemMetaCache::new(
            config.security_timeout(),
            config.security_cache_capacity,
        ));
        Self::with_collaborators(config, Box::new(OrderedNameTable::new()), cache, security_cache)
    }

    pub fn with_collaborators(
        config: VolumeConfig,
        table: Box<dyn NameTable>,
        cache: Arc<dyn CacheEngine>,
        security_cache: Arc<dyn MetaCache>,
    ) -> FsResult<Self> {
        config.validate()?;
        info!(
            target: "volnode::table",
            case_sensitive = config.case_sensitive,
            allocation_unit = config.allocation_unit(),
            max_file_nodes = config.limits.max_file_nodes,
            max_open_handles = config.limits.max_open_handles,
            "volume registry initialized"
        );
        Ok(Self {
            config,
            table: Mutex::new(table),
            cache,
            security_cache,
            next_node_id: AtomicU64::new(1),
            live_nodes: Arc::new(AtomicUsize::new(0)),
            live_descs: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    fn key<'a>(&self, name: &'a str) -> Cow<'a, str> {
        normalize_key(name, self.config.case_sensitive)
    }

    fn validate_name(&self, name: &str) -> FsResult<()> {
        if name.is_empty() || name.len() > self.config.limits.max_name_bytes {
            return Err(FsError::InvalidName);
        }
        Ok(())
    }

    /// A new unregistered node named `name`, holding one reference (the
    /// returned `Arc`).
    pub fn create_node(&self, name: &str) -> FsResult<Arc<FileNode>> {
        self.validate_name(name)?;
        let live = LiveGuard::try_acquire(&self.live_nodes, self.config.limits.max_file_nodes)
            .ok_or_else(|| {
                warn!(target: "volnode::node", %name, "file node limit reached");
                FsError::ResourceExhausted
            })?;

        let mut owned = String::new();
        owned
            .try_reserve_exact(name.len())
            .map_err(|_| FsError::ResourceExhausted)?;
        owned.push_str(name);

        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed));
        debug!(target: "volnode::node", node = id.0, %name, "node created");
        Ok(Arc::new(FileNode::new(NodeParams {
            id,
            name: owned,
            allocation_unit: self.config.allocation_unit(),
            file_info_timeout: self.config.file_info_timeout(),
            cache: Arc::clone(&self.cache),
            security_cache: Arc::clone(&self.security_cache),
            live,
        })))
    }

    pub fn create_file_desc(&self) -> FsResult<FileDesc> {
        LiveGuard::try_acquire(&self.live_descs, self.config.limits.max_open_handles)
            .map(FileDesc::new)
            .ok_or(FsError::ResourceExhausted)
    }

    pub fn lock_table(&self) -> TableGuard<'_> {
        TableGuard {
            volume: self,
            table: self.table.lock(),
        }
    }

    /// Register a handle on the node named like `candidate`.
    ///
    /// If the name is not yet registered, `candidate` becomes the node for it.
    /// Otherwise the existing node is used, provided it is not pending delete,
    /// the requested sharing is compatible with every handle already open,
    /// and (for data access that refuses write sharing) no user-writable
    /// mapping of it exists. The returned reference belongs to the handle
    /// and is given back through [`Volume::close`].
    pub fn open(
        &self,
        candidate: &Arc<FileNode>,
        file_object: &mut FileObject,
        granted: GrantedAccess,
        share: ShareMode,
    ) -> FsResult<Arc<FileNode>> {
        let requested = ShareReservation::new(granted, share);
        let name = candidate.file_name();
        let key = self.key(&name);

        let mut table = self.table.lock();
        let (node, inserted) = table.insert_if_absent(&key, candidate);
        let mut state = node.table_state();

        if inserted {
            state.share_access.set(&requested);
        } else {
            if node.delete_pending() {
                warn!(target: "volnode::table", node = node.id().0, %name, "open refused: delete pending");
                return Err(FsError::DeletePending);
            }

            // Data access without write sharing is refused while a
            // user-writable mapping exists.
            if !share.contains(ShareMode::WRITE)
                && granted.intersects(GrantedAccess::DATA_ACCESS)
                && self.cache.has_user_writable_references(node.id())
            {
                warn!(target: "volnode::table", node = node.id().0, %name, "open refused: writable mapping");
                return Err(FsError::SharingViolation);
            }

            if let Err(err) = state.share_access.check_and_update(&requested) {
                warn!(target: "volnode::table", node = node.id().0, %name, ?granted, ?share, "open refused: sharing");
                return Err(err);
            }
        }

        state.open_count += 1;
        state.handle_count += 1;
        file_object.reservation = requested;
        trace!(
            target: "volnode::table",
            node = node.id().0,
            handle = file_object.id().0,
            inserted,
            open_count = state.open_count,
            handle_count = state.handle_count,
            "handle opened"
        );
        drop(state);
        drop(table);
        Ok(node)
    }

    /// First phase of handle teardown. Records the handle's delete-on-close
    /// intent and reports whether the caller must delete the file now: true
    /// only for the last handle of a delete-pending node.
    pub fn cleanup(&self, node: &FileNode, file_object: &FileObject) -> bool {
        let _table = self.table.lock();
        if file_object.delete_on_close() {
            node.mark_delete_pending();
        }
        let delete_pending = node.delete_pending();
        let single_handle = node.table_state().handle_count == 1;
        single_handle && delete_pending
    }

    /// Second phase of handle teardown: drop the handle's share reservation
    /// and, for the last handle, detach the cache map (truncating when the
    /// node is deleted or marked truncate-on-close).
    pub fn cleanup_complete(&self, node: &FileNode, file_object: &mut FileObject) {
        let mut truncate_size = None;
        let mut removed = None;
        {
            let mut table = self.table.lock();
            let mut state = node.table_state();
            state.share_access.remove(&file_object.reservation);
            file_object.reservation = ShareReservation::default();

            debug_assert!(state.handle_count > 0, "cleanup without open handle");
            state.handle_count = state.handle_count.saturating_sub(1);
            if state.handle_count == 0 {
                if node.delete_pending() {
                    truncate_size = Some(0);
                    state.open_count = state.open_count.saturating_sub(1);
                    if state.open_count == 0 {
                        removed = table.remove(&self.key(&node.file_name()));
                    }
                } else if node.truncate_on_close() && file_object.is_cache_supported() {
                    truncate_size = Some(node.cached_file_size());
                }
            }
            trace!(
                target: "volnode::table",
                node = node.id().0,
                handle = file_object.id().0,
                open_count = state.open_count,
                handle_count = state.handle_count,
                "handle cleaned up"
            );
        }

        self.cache.uninitialize_cache_map(file_object.id(), truncate_size);
        if let Some(removed) = removed {
            debug!(target: "volnode::table", node = removed.id().0, "deleted node unregistered");
        }
    }

    /// Final phase of handle teardown: give back the handle's reference.
    /// The node leaves the table once no open references remain; both the
    /// table's reference and `node` are dropped after the table lock.
    pub fn close(&self, node: Arc<FileNode>, file_object: FileObject) {
        let removed = {
            let mut table = self.table.lock();
            let mut state = node.table_state();
            if state.open_count > 0 {
                state.open_count -= 1;
                if state.open_count == 0 {
                    table.remove(&self.key(&node.file_name()))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(removed) = &removed {
            debug_assert!(Arc::ptr_eq(removed, &node), "table entry replaced while open");
            trace!(target: "volnode::table", node = removed.id().0, "node unregistered");
        }
        trace!(target: "volnode::table", node = node.id().0, handle = file_object.id().0, "handle closed");
        drop(file_object);
        drop(removed);
        drop(node);
    }

    /// Rename a registered node, see [`TableGuard::rename`].
    pub fn rename(&self, node: &Arc<FileNode>, new_name: &str) -> FsResult<()> {
        self.lock_table().rename(node, new_name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.lock_table().lookup(name)
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes alive anywhere, registered or not
    pub fn live_nodes(&self) -> usize {
        self.live_nodes.load(Ordering::Acquire)
    }

    pub fn live_file_descs(&self) -> usize {
        self.live_descs.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn table_locked(&self) -> bool {
        self.table.is_locked()
    }
}

/// The volume table lock, held.
///
/// Operations that must run as one step with other table work take the
/// guard instead of locking on their own.
pub struct TableGuard<'a> {
    volume: &'a Volume,
    table: MutexGuard<'a, Box<dyn NameTable>>,
}

impl TableGuard<'_> {
    pub fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.table.get(&self.volume.key(name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether the node named `name`, or with `subpath_only` any node below
    /// it, still has handles that were not cleaned up.
    pub fn has_open_handles(&self, name: &str, subpath_only: bool) -> bool {
        let key = self.volume.key(name);
        self.table
            .enumerate(&key, subpath_only)
            .any(|node| node.table_state().handle_count > 0)
    }

    /// Move `node` to `new_name` in one step: no lookup under the table lock
    /// sees it under both names or under neither.
    ///
    /// # Panics
    ///
    /// If `node` is not the node registered under its current name, or the
    /// new name is already registered. Callers check both first.
    pub fn rename(&mut self, node: &Arc<FileNode>, new_name: &str) -> FsResult<()> {
        self.volume.validate_name(new_name)?;
        let mut owned = String::new();
        owned
            .try_reserve_exact(new_name.len())
            .map_err(|_| FsError::ResourceExhausted)?;
        owned.push_str(new_name);

        let old_name = node.file_name();
        let old_key = self.volume.key(&old_name).into_owned();
        let new_key = self.volume.key(new_name).into_owned();
        if old_key == new_key {
            node.set_file_name(owned);
            return Ok(());
        }

        assert!(
            self.table.get(&new_key).is_none(),
            "rename target {new_name} already registered"
        );
        let removed = self.table.remove(&old_key);
        assert!(
            removed.as_ref().is_some_and(|r| Arc::ptr_eq(r, node)),
            "renamed node {old_name} is not registered"
        );
        node.set_file_name(owned);
        let (_, inserted) = self.table.insert_if_absent(&new_key, node);
        assert!(inserted, "rename target {new_name} already registered");

        debug!(target: "volnode::table", node = node.id().0, from = %old_name, to = %new_name, "node renamed");
        Ok(())
    }
}
