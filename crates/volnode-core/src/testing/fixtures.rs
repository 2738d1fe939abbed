// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume fixtures backed by the in-memory cache engine

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::FsResult;
use crate::{
    FileNode, FileObject, FileObjectFlags, GrantedAccess, HandleId, LockContext, LockFlags,
    MemCacheEngine, ShareMode, Volume, VolumeConfig,
};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub fn next_handle() -> HandleId {
    HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

pub fn mem_volume(config: VolumeConfig) -> (Volume, Arc<MemCacheEngine>) {
    let engine = Arc::new(MemCacheEngine::new());
    let volume = Volume::new(config, engine.clone()).expect("valid config");
    (volume, engine)
}

/// An open handle: the node reference it owns plus its file object.
#[derive(Debug)]
pub struct Handle {
    pub node: Arc<FileNode>,
    pub file_object: FileObject,
}

/// Run the create/open path for `name`, attaching a fresh descriptor.
pub fn open(
    volume: &Volume,
    name: &str,
    granted: GrantedAccess,
    share: ShareMode,
) -> FsResult<Handle> {
    let candidate = volume.create_node(name)?;
    let mut file_object = FileObject::new(next_handle(), FileObjectFlags::CACHE_SUPPORTED);
    file_object.attach_desc(volume.create_file_desc()?);
    let node = volume.open(&candidate, &mut file_object, granted, share)?;
    Ok(Handle { node, file_object })
}

pub fn open_shared(volume: &Volume, name: &str) -> Handle {
    open(volume, name, GrantedAccess::READ_DATA, ShareMode::all()).expect("shared open")
}

/// Run cleanup (under Content exclusive), cleanup-complete and close.
/// Returns what cleanup reported.
pub fn close(volume: &Volume, handle: Handle) -> bool {
    let Handle {
        node,
        mut file_object,
    } = handle;
    let delete_now = cleanup_locked(volume, &node, &file_object);
    volume.cleanup_complete(&node, &mut file_object);
    volume.close(node, file_object);
    delete_now
}

/// `Volume::cleanup` with the node's Content tier held exclusive.
pub fn cleanup_locked(volume: &Volume, node: &FileNode, file_object: &FileObject) -> bool {
    let mut ctx = LockContext::new();
    node.acquire_exclusive(LockFlags::CONTENT, &mut ctx)
        .expect("content lock for cleanup");
    let delete_now = volume.cleanup(node, file_object);
    node.release(LockFlags::CONTENT, &mut ctx)
        .expect("content unlock after cleanup");
    delete_now
}
