// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Registry scenarios driven through whole handle lifecycles

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock, Weak};
use std::thread;

use crate::cache::CacheEngine;
use crate::error::CacheResult;
use crate::testing::fixtures::{self, close, mem_volume, open, open_shared, Handle};
use crate::{
    FileInfo, FileObject, FileObjectFlags, FileSizes, FsError, GrantedAccess, HandleId,
    LockContext, LockFlags, MemCacheEngine, MemMetaCache, NodeId, OrderedNameTable, ShareMode,
    Volume, VolumeConfig, VolumeLimits, WRITE_TO_END_OF_FILE,
};

const PATH: &str = r"\dir\file.txt";

#[test]
fn concurrent_opens_converge_on_one_node() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let threads = 8;
    let barrier = Barrier::new(threads);

    let handles: Vec<Handle> = thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    open_shared(&volume, PATH)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let first = &handles[0].node;
    assert!(handles.iter().all(|h| Arc::ptr_eq(&h.node, first)));
    assert_eq!(volume.len(), 1);
    // Losing candidates were dropped by their threads.
    assert_eq!(volume.live_nodes(), 1);
    assert_eq!(first.open_count(), threads as u32);
    assert_eq!(first.handle_count(), threads as u32);

    for handle in handles {
        close(&volume, handle);
    }
    assert!(volume.is_empty());
    assert_eq!(volume.live_nodes(), 0);
}

#[test]
fn matching_closes_unregister_and_release_the_node() {
    let (volume, engine) = mem_volume(VolumeConfig::default());
    let handles: Vec<Handle> = (0..5).map(|_| open_shared(&volume, PATH)).collect();
    let weak = Arc::downgrade(&handles[0].node);
    let id = handles[0].node.id();

    let mut remaining = handles.into_iter();
    for handle in remaining.by_ref().take(4) {
        close(&volume, handle);
        assert!(volume.lookup(PATH).is_some());
    }
    close(&volume, remaining.next().unwrap());

    assert!(volume.lookup(PATH).is_none());
    assert!(weak.upgrade().is_none());
    assert_eq!(volume.live_nodes(), 0);
    assert_eq!(volume.live_file_descs(), 0);
    assert_eq!(engine.section_stats(id), Default::default());
}

#[test]
fn delete_on_close_with_single_handle_deletes_now() {
    let (volume, engine) = mem_volume(VolumeConfig::default());
    let mut handle = open(
        &volume,
        PATH,
        GrantedAccess::DELETE,
        ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE,
    )
    .unwrap();
    handle.file_object.desc_mut().unwrap().delete_on_close = true;
    let id = handle.file_object.id();

    assert!(close(&volume, handle));
    assert_eq!(engine.uninitialized_with(id), Some(Some(0)));
    assert!(volume.is_empty());
}

#[test]
fn delete_on_close_waits_for_the_last_handle() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let mut a = open_shared(&volume, PATH);
    let b = open_shared(&volume, PATH);
    a.file_object.desc_mut().unwrap().delete_on_close = true;

    assert!(!fixtures::cleanup_locked(&volume, &a.node, &a.file_object));
    assert!(a.node.delete_pending());
    volume.cleanup_complete(&a.node, &mut a.file_object);
    volume.close(a.node, a.file_object);

    assert!(volume.lookup(PATH).is_some());
    assert!(close(&volume, b));
    assert!(volume.is_empty());
}

#[test]
fn delete_pending_blocks_opens_until_the_node_is_gone() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let mut a = open_shared(&volume, PATH);
    a.file_object.desc_mut().unwrap().delete_on_close = true;
    assert!(fixtures::cleanup_locked(&volume, &a.node, &a.file_object));
    let old = Arc::downgrade(&a.node);

    for _ in 0..3 {
        let err = open(&volume, PATH, GrantedAccess::READ_DATA, ShareMode::all()).unwrap_err();
        assert!(matches!(err, FsError::DeletePending));
    }

    volume.cleanup_complete(&a.node, &mut a.file_object);
    assert!(volume.lookup(PATH).is_none());
    volume.close(a.node, a.file_object);
    assert!(old.upgrade().is_none());

    let fresh = open_shared(&volume, PATH);
    assert!(!fresh.node.delete_pending());
    close(&volume, fresh);
}

#[test]
fn opens_racing_a_deleting_cleanup_are_refused_once_it_returns() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let mut a = open_shared(&volume, PATH);
    a.file_object.desc_mut().unwrap().delete_on_close = true;

    let cleaned = AtomicBool::new(false);
    let stop = AtomicBool::new(false);
    let opened = AtomicUsize::new(0);
    let openers = 4;

    thread::scope(|s| {
        for _ in 0..openers {
            s.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    let after_cleanup = cleaned.load(Ordering::SeqCst);
                    match open(&volume, PATH, GrantedAccess::READ_DATA, ShareMode::all()) {
                        Ok(handle) => {
                            assert!(!after_cleanup, "open admitted after delete cleanup");
                            opened.fetch_add(1, Ordering::SeqCst);
                            assert!(!close(&volume, handle));
                        }
                        Err(err) => assert!(matches!(err, FsError::DeletePending)),
                    }
                }
            });
        }

        while opened.load(Ordering::SeqCst) < openers {
            thread::yield_now();
        }
        fixtures::cleanup_locked(&volume, &a.node, &a.file_object);
        cleaned.store(true, Ordering::SeqCst);

        let mut last = a.node.handle_count();
        for _ in 0..2000 {
            let now = a.node.handle_count();
            assert!(now <= last, "handle count rose from {last} to {now}");
            last = now;
            thread::yield_now();
        }
        stop.store(true, Ordering::SeqCst);
    });

    assert_eq!(a.node.handle_count(), 1);
    volume.cleanup_complete(&a.node, &mut a.file_object);
    volume.close(a.node, a.file_object);
    assert!(volume.is_empty());
    assert_eq!(volume.live_nodes(), 0);
}

#[test]
fn stale_metadata_version_is_rejected_across_handles() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let a = open_shared(&volume, PATH);
    let b = open_shared(&volume, PATH);

    let seen = a.node.info_change_number();
    b.node.set_file_info(
        Some(&b.file_object),
        &FileInfo {
            file_size: 42,
            ..FileInfo::default()
        },
    );
    let stale = FileInfo {
        file_size: 7,
        ..FileInfo::default()
    };
    assert!(!a.node.try_set_file_info(Some(&a.file_object), &stale, seen));
    assert_eq!(a.node.get_file_info().file_size, 42);
    assert_eq!(a.node.info_change_number(), seen + 1);

    assert!(a.node.try_set_file_info(Some(&a.file_object), &stale, seen + 1));
    assert_eq!(a.node.get_file_info().file_size, 7);
    assert_eq!(a.node.info_change_number(), seen + 2);

    close(&volume, a);
    close(&volume, b);
}

#[test]
fn rename_is_atomic_to_concurrent_lookups() {
    const FROM: &str = r"\dir\p";
    const TO: &str = r"\dir\q";

    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let handle = open_shared(&volume, FROM);
    let stop = AtomicBool::new(false);
    let observed = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    let table = volume.lock_table();
                    let p = table.lookup(FROM);
                    let q = table.lookup(TO);
                    assert!(p.is_some() != q.is_some(), "node visible under both or neither name");
                    drop(table);
                    observed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        while observed.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        for round in 0..200 {
            let (from, to) = if round % 2 == 0 { (FROM, TO) } else { (TO, FROM) };
            volume.rename(&handle.node, to).unwrap();
            assert_eq!(handle.node.file_name(), to);
            assert!(volume.lookup(from).is_none());
        }
        stop.store(true, Ordering::Release);
    });

    volume.rename(&handle.node, TO).unwrap();
    assert!(volume.lookup(FROM).is_none());
    assert!(Arc::ptr_eq(&volume.lookup(TO).unwrap(), &handle.node));
    close(&volume, handle);
    assert!(volume.is_empty());
}

#[test]
fn rename_rejects_invalid_names_without_touching_the_table() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let handle = open_shared(&volume, PATH);
    assert!(matches!(volume.rename(&handle.node, ""), Err(FsError::InvalidName)));
    assert!(Arc::ptr_eq(&volume.lookup(PATH).unwrap(), &handle.node));
    close(&volume, handle);
}

#[test]
fn writable_mapping_refuses_opens_without_write_sharing() {
    let (volume, engine) = mem_volume(VolumeConfig::default());
    let writer = open(&volume, PATH, GrantedAccess::WRITE_DATA, ShareMode::all()).unwrap();
    engine.set_user_writable(writer.node.id(), true);

    let err = open(
        &volume,
        PATH,
        GrantedAccess::READ_DATA,
        ShareMode::READ | ShareMode::DELETE,
    )
    .unwrap_err();
    assert!(matches!(err, FsError::SharingViolation));

    // Attribute-only access is not data access.
    let attrs = open(&volume, PATH, GrantedAccess::READ_ATTRIBUTES, ShareMode::READ).unwrap();
    let sharing = open(&volume, PATH, GrantedAccess::READ_DATA, ShareMode::all()).unwrap();

    close(&volume, attrs);
    close(&volume, sharing);
    close(&volume, writer);
}

#[test]
fn conflicting_share_modes_are_refused_until_the_holder_closes() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let writer = open(&volume, PATH, GrantedAccess::WRITE_DATA, ShareMode::READ).unwrap();

    let err = open(&volume, PATH, GrantedAccess::READ_DATA, ShareMode::READ).unwrap_err();
    assert!(matches!(err, FsError::SharingViolation));
    assert_eq!(writer.node.handle_count(), 1);

    close(&volume, writer);
    let reader = open(&volume, PATH, GrantedAccess::READ_DATA, ShareMode::READ).unwrap();
    close(&volume, reader);
}

#[test]
fn open_handles_are_found_below_a_directory() {
    let (volume, _engine) = mem_volume(VolumeConfig::default());
    let mut handle = open_shared(&volume, r"\dir\sub\f");
    let sibling = open_shared(&volume, r"\dirx");

    {
        let table = volume.lock_table();
        assert!(table.has_open_handles(r"\dir", true));
        assert!(table.has_open_handles(r"\dir", false));
        assert!(table.has_open_handles(r"\dir\sub\f", false));
        assert!(!table.has_open_handles(r"\dir\sub\f", true));
        assert!(!table.has_open_handles(r"\other", false));
    }

    // Cleaned up but not yet closed: registered, no open handles.
    fixtures::cleanup_locked(&volume, &handle.node, &handle.file_object);
    volume.cleanup_complete(&handle.node, &mut handle.file_object);
    assert!(volume.lookup(r"\dir\sub\f").is_some());
    assert!(!volume.lock_table().has_open_handles(r"\dir", true));

    volume.close(handle.node, handle.file_object);
    close(&volume, sibling);
}

#[test]
fn truncate_on_close_uses_cached_size_for_cached_handles() {
    let (volume, engine) = mem_volume(VolumeConfig::default());
    let handle = open_shared(&volume, PATH);
    handle.node.set_file_info(
        Some(&handle.file_object),
        &FileInfo {
            file_size: 500,
            ..FileInfo::default()
        },
    );
    handle.node.set_truncate_on_close(true);
    let id = handle.file_object.id();
    close(&volume, handle);
    assert_eq!(engine.uninitialized_with(id), Some(Some(500)));

    let plain = open_shared(&volume, PATH);
    let id = plain.file_object.id();
    close(&volume, plain);
    assert_eq!(engine.uninitialized_with(id), Some(None));
}

#[test]
fn truncate_on_close_ignores_uncached_handles() {
    let (volume, engine) = mem_volume(VolumeConfig::default());
    let candidate = volume.create_node(PATH).unwrap();
    let mut file_object = FileObject::new(fixtures::next_handle(), FileObjectFlags::empty());
    let node = volume
        .open(&candidate, &mut file_object, GrantedAccess::READ_DATA, ShareMode::all())
        .unwrap();
    drop(candidate);
    node.set_truncate_on_close(true);
    let id = file_object.id();
    close(&volume, Handle { node, file_object });
    assert_eq!(engine.uninitialized_with(id), Some(None));
}

#[test]
fn case_insensitive_volume_folds_names_but_keeps_spelling() {
    let config = VolumeConfig {
        case_sensitive: false,
        ..VolumeConfig::default()
    };
    let (volume, _engine) = mem_volume(config);
    let a = open_shared(&volume, r"\Dir\File.txt");
    let b = open_shared(&volume, r"\DIR\file.TXT");
    assert!(Arc::ptr_eq(&a.node, &b.node));
    assert_eq!(a.node.file_name(), r"\Dir\File.txt");

    volume.rename(&a.node, r"\dir\FILE.txt").unwrap();
    assert_eq!(a.node.file_name(), r"\dir\FILE.txt");
    assert!(volume.lookup(r"\DIR\FILE.TXT").is_some());
    assert_eq!(volume.len(), 1);

    close(&volume, a);
    close(&volume, b);
}

#[test]
fn node_and_descriptor_limits_are_enforced() {
    let config = VolumeConfig {
        limits: VolumeLimits {
            max_file_nodes: 2,
            max_open_handles: 1,
            max_name_bytes: 8,
        },
        ..VolumeConfig::default()
    };
    let (volume, _engine) = mem_volume(config);

    let a = volume.create_node(r"\a").unwrap();
    let _b = volume.create_node(r"\b").unwrap();
    assert!(matches!(volume.create_node(r"\c"), Err(FsError::ResourceExhausted)));
    drop(a);
    assert!(volume.create_node(r"\c").is_ok());

    let desc = volume.create_file_desc().unwrap();
    assert!(matches!(volume.create_file_desc(), Err(FsError::ResourceExhausted)));
    drop(desc);
    assert_eq!(volume.live_file_descs(), 0);

    assert!(matches!(volume.create_node(""), Err(FsError::InvalidName)));
    assert!(matches!(volume.create_node(r"\too\long"), Err(FsError::InvalidName)));
}

#[test]
fn flush_under_full_lock_resolves_end_of_file() {
    let (volume, engine) = mem_volume(VolumeConfig {
        file_info_timeout_ms: crate::INFINITE_TIMEOUT_MS,
        ..VolumeConfig::default()
    });
    let handle = open_shared(&volume, PATH);
    let node = &handle.node;
    node.set_file_info(
        None,
        &FileInfo {
            file_size: 1234,
            ..FileInfo::default()
        },
    );

    let mut ctx = LockContext::new();
    node.acquire_exclusive(LockFlags::FULL, &mut ctx).unwrap();
    node.flush_and_purge_cache(WRITE_TO_END_OF_FILE, 100, true).unwrap();
    node.release(LockFlags::FULL, &mut ctx).unwrap();

    assert_eq!(
        engine.section_stats(node.id()).last_range,
        Some((Some(1234), 100))
    );
    close(&volume, handle);
}

/// Cache engine that records node teardowns happening under the table lock.
struct TeardownRecorder {
    inner: MemCacheEngine,
    volume: OnceLock<Weak<Volume>>,
    torn_down: AtomicUsize,
    under_lock: AtomicUsize,
}

impl CacheEngine for TeardownRecorder {
    fn supports_coherency_flush(&self) -> bool {
        self.inner.supports_coherency_flush()
    }

    fn coherency_flush_and_purge(
        &self,
        section: NodeId,
        offset: Option<u64>,
        length: u32,
        purge: bool,
    ) -> CacheResult<()> {
        self.inner.coherency_flush_and_purge(section, offset, length, purge)
    }

    fn flush(&self, section: NodeId, offset: Option<u64>, length: u32) -> CacheResult<()> {
        self.inner.flush(section, offset, length)
    }

    fn purge(&self, section: NodeId, offset: Option<u64>, length: u32) -> bool {
        self.inner.purge(section, offset, length)
    }

    fn has_user_writable_references(&self, section: NodeId) -> bool {
        self.inner.has_user_writable_references(section)
    }

    fn set_file_sizes(&self, handle: HandleId, sizes: &FileSizes) -> CacheResult<()> {
        self.inner.set_file_sizes(handle, sizes)
    }

    fn uninitialize_cache_map(&self, handle: HandleId, truncate_size: Option<u64>) {
        self.inner.uninitialize_cache_map(handle, truncate_size)
    }

    fn teardown_section(&self, section: NodeId) {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        if let Some(volume) = self.volume.get().and_then(Weak::upgrade) {
            if volume.table_locked() {
                self.under_lock.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.teardown_section(section)
    }
}

#[test]
fn nodes_are_destroyed_outside_the_table_lock() {
    let recorder = Arc::new(TeardownRecorder {
        inner: MemCacheEngine::new(),
        volume: OnceLock::new(),
        torn_down: AtomicUsize::new(0),
        under_lock: AtomicUsize::new(0),
    });
    let volume = Arc::new(
        Volume::with_collaborators(
            VolumeConfig::default(),
            Box::new(OrderedNameTable::new()),
            recorder.clone(),
            Arc::new(MemMetaCache::new(None, 16)),
        )
        .unwrap(),
    );
    let _ = recorder.volume.set(Arc::downgrade(&volume));

    // Plain close path.
    let handle = open_shared(&volume, PATH);
    close(&volume, handle);

    // Delete path: the table reference goes in cleanup-complete, the
    // handle's reference in close.
    let mut a = open_shared(&volume, PATH);
    let b = open_shared(&volume, PATH);
    a.file_object.desc_mut().unwrap().delete_on_close = true;
    close(&volume, b);
    close(&volume, a);

    // Two registered nodes plus the candidate that lost to `a`.
    assert_eq!(recorder.torn_down.load(Ordering::SeqCst), 3);
    assert_eq!(volume.live_nodes(), 0);
    assert_eq!(recorder.under_lock.load(Ordering::SeqCst), 0);
    assert!(volume.is_empty());
}
