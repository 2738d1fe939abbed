// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Key → blob cache used for security descriptors

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::CacheItemId;

#[cfg_attr(test, mockall::automock)]
pub trait MetaCache: Send + Sync {
    /// Store a copy of `buffer`, returning the id that references it.
    fn add_item(&self, buffer: &[u8]) -> CacheItemId;

    /// The cached buffer, or `None` once the item was invalidated or expired.
    fn reference_item_buffer(&self, item: CacheItemId) -> Option<Arc<[u8]>>;

    fn invalidate_item(&self, item: CacheItemId);
}

struct CacheEntry {
    buffer: Arc<[u8]>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheItemId, CacheEntry>,
    order: VecDeque<CacheItemId>,
}

/// In-memory cache with per-item expiry and oldest-first eviction
pub struct MemMetaCache {
    next_id: AtomicU64,
    timeout: Option<Duration>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl MemMetaCache {
    /// `timeout` of `None` keeps items until invalidated or evicted.
    pub fn new(timeout: Option<Duration>, capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timeout,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetaCache for MemMetaCache {
    fn add_item(&self, buffer: &[u8]) -> CacheItemId {
        let id = CacheItemId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let expires_at = self.timeout.and_then(|t| now.checked_add(t));

        let mut state = self.state.lock();
        state
            .entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        let CacheState { entries, order } = &mut *state;
        order.retain(|id| entries.contains_key(id));
        while entries.len() >= self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    entries.remove(&oldest);
                }
                None => break,
            }
        }
        entries.insert(
            id,
            CacheEntry {
                buffer: Arc::from(buffer),
                expires_at,
            },
        );
        order.push_back(id);
        id
    }

    fn reference_item_buffer(&self, item: CacheItemId) -> Option<Arc<[u8]>> {
        let state = self.state.lock();
        let entry = state.entries.get(&item)?;
        if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
            return None;
        }
        Some(Arc::clone(&entry.buffer))
    }

    fn invalidate_item(&self, item: CacheItemId) {
        let mut state = self.state.lock();
        if state.entries.remove(&item).is_some() {
            state.order.retain(|id| *id != item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_returns_stored_copy() {
        let cache = MemMetaCache::new(None, 8);
        let id = cache.add_item(b"O:BAG:BAD:P");
        assert_eq!(cache.reference_item_buffer(id).as_deref(), Some(&b"O:BAG:BAD:P"[..]));
    }

    #[test]
    fn invalidated_item_is_gone_but_outstanding_views_stay_readable() {
        let cache = MemMetaCache::new(None, 8);
        let id = cache.add_item(b"sd");
        let view = cache.reference_item_buffer(id).unwrap();
        cache.invalidate_item(id);
        assert!(cache.reference_item_buffer(id).is_none());
        assert_eq!(&*view, b"sd");
        assert!(cache.is_empty());
    }

    #[test]
    fn oldest_item_is_evicted_at_capacity() {
        let cache = MemMetaCache::new(None, 2);
        let a = cache.add_item(b"a");
        let b = cache.add_item(b"b");
        let c = cache.add_item(b"c");
        assert!(cache.reference_item_buffer(a).is_none());
        assert!(cache.reference_item_buffer(b).is_some());
        assert!(cache.reference_item_buffer(c).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let cache = MemMetaCache::new(Some(Duration::ZERO), 4);
        let id = cache.add_item(b"x");
        assert!(cache.reference_item_buffer(id).is_none());
    }
}
