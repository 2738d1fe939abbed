// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The shared per-file node
//!
//! A node is reached through `Arc<FileNode>`; the strong count plays the
//! role of the reference count. The name table owns one reference while the
//! node is registered and every open handle owns one more. The last drop
//! releases the cached security descriptor and tears down the cache section.
//!
//! State is split by the lock that guards it:
//!
//! * open/handle counts and the share-access counters live in [`TableState`]
//!   and are only touched while the volume table lock is held (lock order is
//!   table lock, then node state);
//! * `delete_pending` is an atomic published with a full fence;
//! * cached metadata and the security reference each sit behind their own
//!   short-held mutex, which is never held across a cache engine call.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, trace};

use crate::cache::CacheEngine;
use crate::error::{CacheError, FsResult};
use crate::file_desc::FileObject;
use crate::live::LiveGuard;
use crate::lock_pair::{LockContext, LockPair, OwnerToken};
use crate::meta_cache::MetaCache;
use crate::share_access::ShareAccess;
use crate::{CacheItemId, FileInfo, FileSizes, LockFlags, NodeId, WRITE_TO_END_OF_FILE};

/// Counts and share state guarded by the volume table lock.
#[derive(Debug, Default)]
pub(crate) struct TableState {
    pub(crate) open_count: u32,
    pub(crate) handle_count: u32,
    pub(crate) share_access: ShareAccess,
}

#[derive(Clone, Copy, Debug)]
enum Expiration {
    Expired,
    At(Instant),
    Never,
}

impl Expiration {
    fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Expiration::Never,
            Some(timeout) => Instant::now()
                .checked_add(timeout)
                .map_or(Expiration::Never, Expiration::At),
        }
    }

    fn is_live(self) -> bool {
        match self {
            Expiration::Expired => false,
            Expiration::At(at) => Instant::now() < at,
            Expiration::Never => true,
        }
    }
}

#[derive(Debug)]
struct InfoState {
    info: FileInfo,
    expiration: Expiration,
    change_number: u32,
}

#[derive(Debug, Default)]
struct SecurityState {
    item: Option<CacheItemId>,
    change_number: u32,
}

/// Construction parameters the volume hands to every node
pub(crate) struct NodeParams {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) allocation_unit: u64,
    pub(crate) file_info_timeout: Option<Duration>,
    pub(crate) cache: Arc<dyn CacheEngine>,
    pub(crate) security_cache: Arc<dyn MetaCache>,
    pub(crate) live: LiveGuard,
}

pub struct FileNode {
    id: NodeId,
    name: RwLock<String>,
    locks: Box<LockPair>,
    table: Mutex<TableState>,
    delete_pending: AtomicBool,
    truncate_on_close: AtomicBool,
    info: Mutex<InfoState>,
    security: Mutex<SecurityState>,
    allocation_unit: u64,
    file_info_timeout: Option<Duration>,
    cache: Arc<dyn CacheEngine>,
    security_cache: Arc<dyn MetaCache>,
    _live: LiveGuard,
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("delete_pending", &self.delete_pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FileNode {
    pub(crate) fn new(params: NodeParams) -> Self {
        Self {
            id: params.id,
            name: RwLock::new(params.name),
            locks: Box::default(),
            table: Mutex::new(TableState::default()),
            delete_pending: AtomicBool::new(false),
            truncate_on_close: AtomicBool::new(false),
            info: Mutex::new(InfoState {
                info: FileInfo::default(),
                expiration: Expiration::Expired,
                change_number: 0,
            }),
            security: Mutex::new(SecurityState::default()),
            allocation_unit: params.allocation_unit.max(1),
            file_info_timeout: params.file_info_timeout,
            cache: params.cache,
            security_cache: params.security_cache,
            _live: params.live,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn file_name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_file_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub(crate) fn table_state(&self) -> MutexGuard<'_, TableState> {
        self.table.lock()
    }

    /// Number of references the name table accounts for. A snapshot; only
    /// meaningful under the table lock.
    pub fn open_count(&self) -> u32 {
        self.table.lock().open_count
    }

    /// Number of handles not yet cleaned up. A snapshot; only meaningful
    /// under the table lock.
    pub fn handle_count(&self) -> u32 {
        self.table.lock().handle_count
    }

    pub fn delete_pending(&self) -> bool {
        let pending = self.delete_pending.load(Ordering::SeqCst);
        fence(Ordering::SeqCst);
        pending
    }

    pub(crate) fn mark_delete_pending(&self) {
        self.delete_pending.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    pub fn set_truncate_on_close(&self, truncate: bool) {
        self.truncate_on_close.store(truncate, Ordering::SeqCst);
    }

    pub fn truncate_on_close(&self) -> bool {
        self.truncate_on_close.load(Ordering::SeqCst)
    }

    /// Raw access to the lock pair, for callers that manage holds directly.
    pub fn locks(&self) -> &LockPair {
        &self.locks
    }

    pub fn acquire_shared(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, "acquire shared");
        self.locks.acquire_shared(flags, ctx)
    }

    pub fn acquire_exclusive(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, "acquire exclusive");
        self.locks.acquire_exclusive(flags, ctx)
    }

    pub fn try_acquire_shared(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<bool> {
        let acquired = self.locks.try_acquire_shared(flags, ctx)?;
        trace!(target: "volnode::lock", node = self.id.0, ?flags, acquired, "try acquire shared");
        Ok(acquired)
    }

    pub fn try_acquire_exclusive(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
    ) -> FsResult<bool> {
        let acquired = self.locks.try_acquire_exclusive(flags, ctx)?;
        trace!(target: "volnode::lock", node = self.id.0, ?flags, acquired, "try acquire exclusive");
        Ok(acquired)
    }

    pub fn convert_exclusive_to_shared(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
    ) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, "convert exclusive to shared");
        self.locks.convert_exclusive_to_shared(flags, ctx)
    }

    pub fn set_owner(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
        owner: OwnerToken,
    ) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, owner = owner.0, "set owner");
        self.locks.set_owner(flags, ctx, owner)
    }

    pub fn release(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, "release");
        self.locks.release(flags, ctx)
    }

    pub fn release_owner(
        &self,
        flags: LockFlags,
        owner: OwnerToken,
        ctx: &mut LockContext,
    ) -> FsResult<()> {
        trace!(target: "volnode::lock", node = self.id.0, ?flags, owner = owner.0, "release owner");
        self.locks.release_owner(flags, owner, ctx)
    }

    /// Write back (and optionally evict) cached data for a byte range.
    ///
    /// `offset` of [`WRITE_TO_END_OF_FILE`] resolves to the cached file size,
    /// or to the whole stream when that size has expired. With the coherent
    /// engine path a `PagesLocked` result counts as success.
    pub fn flush_and_purge_cache(&self, offset: u64, length: u32, purge: bool) -> FsResult<()> {
        let offset = if offset == WRITE_TO_END_OF_FILE {
            self.try_get_file_info().map(|info| info.file_size)
        } else {
            Some(offset)
        };

        if self.cache.supports_coherency_flush() {
            match self.cache.coherency_flush_and_purge(self.id, offset, length, purge) {
                Ok(()) => Ok(()),
                Err(CacheError::PagesLocked) => {
                    debug!(
                        target: "volnode::cache",
                        node = self.id.0,
                        ?offset,
                        length,
                        "pages locked during coherent flush; treating as flushed"
                    );
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        } else {
            self.cache.flush(self.id, offset, length)?;
            if purge && !self.cache.purge(self.id, offset, length) {
                debug!(target: "volnode::cache", node = self.id.0, ?offset, length, "purge incomplete");
            }
            Ok(())
        }
    }

    /// Cached metadata, fresh or not.
    pub fn get_file_info(&self) -> FileInfo {
        self.info.lock().info
    }

    /// Cached metadata if it has not expired.
    pub fn try_get_file_info(&self) -> Option<FileInfo> {
        let state = self.info.lock();
        state.expiration.is_live().then_some(state.info)
    }

    pub fn info_change_number(&self) -> u32 {
        self.info.lock().change_number
    }

    /// Replace the cached metadata and, when `cc_file_object` is given,
    /// propagate the new sizes to that handle's cache map.
    ///
    /// A cache map that refuses the new sizes is logged and torn down; the
    /// metadata update itself always takes effect.
    pub fn set_file_info(&self, cc_file_object: Option<&FileObject>, info: &FileInfo) {
        let sizes = {
            let mut state = self.info.lock();
            self.store_info(&mut state, info)
        };
        self.propagate_sizes(cc_file_object, &sizes);
    }

    /// Like [`FileNode::set_file_info`], but only if no other update landed
    /// since `info_change_number` was read. Returns whether it applied.
    pub fn try_set_file_info(
        &self,
        cc_file_object: Option<&FileObject>,
        info: &FileInfo,
        info_change_number: u32,
    ) -> bool {
        let sizes = {
            let mut state = self.info.lock();
            if state.change_number != info_change_number {
                trace!(
                    target: "volnode::node",
                    node = self.id.0,
                    expected = info_change_number,
                    current = state.change_number,
                    "stale metadata update discarded"
                );
                return false;
            }
            self.store_info(&mut state, info)
        };
        self.propagate_sizes(cc_file_object, &sizes);
        true
    }

    fn store_info(&self, state: &mut InfoState, info: &FileInfo) -> FileSizes {
        let allocation_size = info
            .allocation_size
            .max(info.file_size)
            .div_ceil(self.allocation_unit)
            .saturating_mul(self.allocation_unit);

        state.info = FileInfo {
            allocation_size,
            ..*info
        };
        state.expiration = Expiration::after(self.file_info_timeout);
        state.change_number = state.change_number.wrapping_add(1);

        FileSizes {
            allocation_size,
            file_size: info.file_size,
            // valid data length tracking is disabled
            valid_data_length: i64::MAX as u64,
        }
    }

    fn propagate_sizes(&self, cc_file_object: Option<&FileObject>, sizes: &FileSizes) {
        let Some(file_object) = cc_file_object else {
            return;
        };
        if let Err(err) = self.cache.set_file_sizes(file_object.id(), sizes) {
            error!(
                target: "volnode::cache",
                node = self.id.0,
                handle = file_object.id().0,
                %err,
                "failed to update cache map sizes; uninitializing cache map"
            );
            self.cache.uninitialize_cache_map(file_object.id(), None);
        }
    }

    /// The file size recorded in the cached metadata, fresh or not.
    pub(crate) fn cached_file_size(&self) -> u64 {
        self.info.lock().info.file_size
    }

    /// The cached security descriptor, if one is set and still cached.
    pub fn reference_security(&self) -> Option<Arc<[u8]>> {
        let item = self.security.lock().item?;
        self.security_cache.reference_item_buffer(item)
    }

    pub fn security_change_number(&self) -> u32 {
        self.security.lock().change_number
    }

    /// Replace (or with `None`, clear) the cached security descriptor.
    pub fn set_security(&self, buffer: Option<&[u8]>) {
        let mut state = self.security.lock();
        self.store_security(&mut state, buffer);
    }

    /// Like [`FileNode::set_security`], but only if no other update landed
    /// since `security_change_number` was read. Returns whether it applied.
    pub fn try_set_security(&self, buffer: Option<&[u8]>, security_change_number: u32) -> bool {
        let mut state = self.security.lock();
        if state.change_number != security_change_number {
            return false;
        }
        self.store_security(&mut state, buffer);
        true
    }

    fn store_security(&self, state: &mut SecurityState, buffer: Option<&[u8]>) {
        if let Some(old) = state.item.take() {
            self.security_cache.invalidate_item(old);
        }
        state.item = buffer.map(|buffer| self.security_cache.add_item(buffer));
        state.change_number = state.change_number.wrapping_add(1);
    }
}

impl Drop for FileNode {
    fn drop(&mut self) {
        if let Some(item) = self.security.get_mut().item.take() {
            self.security_cache.invalidate_item(item);
        }
        self.cache.teardown_section(self.id);
        debug!(target: "volnode::node", node = self.id.0, name = %self.name.get_mut(), "node destroyed");
    }
}
