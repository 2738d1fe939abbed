// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Byte-range cache engine interface and an in-memory implementation

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::CacheResult;
use crate::fault::{FaultInjector, FaultOp};
use crate::{FileSizes, HandleId, NodeId};

/// The engine that owns cached data pages. Sections are keyed by node,
/// cache maps by handle.
#[cfg_attr(test, mockall::automock)]
pub trait CacheEngine: Send + Sync {
    /// Whether [`CacheEngine::coherency_flush_and_purge`] is available.
    fn supports_coherency_flush(&self) -> bool;

    /// Write back and optionally evict the range in one coherent step.
    /// `offset` of `None` covers the whole stream.
    fn coherency_flush_and_purge(
        &self,
        section: NodeId,
        offset: Option<u64>,
        length: u32,
        purge: bool,
    ) -> CacheResult<()>;

    fn flush(&self, section: NodeId, offset: Option<u64>, length: u32) -> CacheResult<()>;

    /// Returns whether every page in the range could be evicted.
    fn purge(&self, section: NodeId, offset: Option<u64>, length: u32) -> bool;

    /// Whether a user-writable memory mapping of the section exists. Called
    /// with the volume table lock held; must not block.
    fn has_user_writable_references(&self, section: NodeId) -> bool;

    fn set_file_sizes(&self, handle: HandleId, sizes: &FileSizes) -> CacheResult<()>;

    /// Detach the handle's cache map, truncating cached data to
    /// `truncate_size` when given.
    fn uninitialize_cache_map(&self, handle: HandleId, truncate_size: Option<u64>);

    /// Drop all per-section state once the node is gone.
    fn teardown_section(&self, section: NodeId);
}

/// Counters kept per section by [`MemCacheEngine`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SectionStats {
    pub flushes: u64,
    pub purges: u64,
    pub last_range: Option<(Option<u64>, u32)>,
    pub user_writable: bool,
}

#[derive(Default)]
struct EngineState {
    sections: HashMap<NodeId, SectionStats>,
    cache_maps: HashMap<HandleId, FileSizes>,
    uninitialized: HashMap<HandleId, Option<u64>>,
    torn_down: u64,
}

/// In-memory engine that records what was asked of it
pub struct MemCacheEngine {
    coherency: bool,
    faults: FaultInjector,
    state: Mutex<EngineState>,
}

impl Default for MemCacheEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCacheEngine {
    pub fn new() -> Self {
        Self::with_coherency(true)
    }

    pub fn with_coherency(coherency: bool) -> Self {
        Self {
            coherency,
            faults: FaultInjector::new(),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn set_user_writable(&self, section: NodeId, writable: bool) {
        self.state.lock().sections.entry(section).or_default().user_writable = writable;
    }

    pub fn section_stats(&self, section: NodeId) -> SectionStats {
        self.state.lock().sections.get(&section).cloned().unwrap_or_default()
    }

    pub fn cache_map_sizes(&self, handle: HandleId) -> Option<FileSizes> {
        self.state.lock().cache_maps.get(&handle).copied()
    }

    /// Truncate size passed when the handle's cache map was torn down;
    /// `None` if it never was.
    pub fn uninitialized_with(&self, handle: HandleId) -> Option<Option<u64>> {
        self.state.lock().uninitialized.get(&handle).copied()
    }

    pub fn sections_torn_down(&self) -> u64 {
        self.state.lock().torn_down
    }

    fn record(&self, section: NodeId, offset: Option<u64>, length: u32, purged: bool) {
        let mut state = self.state.lock();
        let stats = state.sections.entry(section).or_default();
        stats.flushes += 1;
        stats.purges += u64::from(purged);
        stats.last_range = Some((offset, length));
    }
}

impl CacheEngine for MemCacheEngine {
    fn supports_coherency_flush(&self) -> bool {
        self.coherency
    }

    fn coherency_flush_and_purge(
        &self,
        section: NodeId,
        offset: Option<u64>,
        length: u32,
        purge: bool,
    ) -> CacheResult<()> {
        if let Some(err) = self.faults.should_fault(FaultOp::CoherencyFlush) {
            return Err(err);
        }
        self.record(section, offset, length, purge);
        Ok(())
    }

    fn flush(&self, section: NodeId, offset: Option<u64>, length: u32) -> CacheResult<()> {
        if let Some(err) = self.faults.should_fault(FaultOp::Flush) {
            return Err(err);
        }
        self.record(section, offset, length, false);
        Ok(())
    }

    fn purge(&self, section: NodeId, offset: Option<u64>, length: u32) -> bool {
        if self.faults.should_fault(FaultOp::Purge).is_some() {
            return false;
        }
        let mut state = self.state.lock();
        let stats = state.sections.entry(section).or_default();
        stats.purges += 1;
        stats.last_range = Some((offset, length));
        true
    }

    fn has_user_writable_references(&self, section: NodeId) -> bool {
        self.state.lock().sections.get(&section).is_some_and(|s| s.user_writable)
    }

    fn set_file_sizes(&self, handle: HandleId, sizes: &FileSizes) -> CacheResult<()> {
        if let Some(err) = self.faults.should_fault(FaultOp::SetFileSizes) {
            return Err(err);
        }
        self.state.lock().cache_maps.insert(handle, *sizes);
        Ok(())
    }

    fn uninitialize_cache_map(&self, handle: HandleId, truncate_size: Option<u64>) {
        let mut state = self.state.lock();
        state.cache_maps.remove(&handle);
        state.uninitialized.insert(handle, truncate_size);
    }

    fn teardown_section(&self, section: NodeId) {
        let mut state = self.state.lock();
        state.sections.remove(&section);
        state.torn_down += 1;
    }
}
