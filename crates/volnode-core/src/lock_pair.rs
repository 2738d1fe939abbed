// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Two-tier reader/writer lock (Content + PagingIo) with owner tokens
//!
//! Tiers are always acquired Content first, then PagingIo, and released or
//! downgraded in the reverse order. The raw locks carry no thread identity,
//! so a hold can be parked under an [`OwnerToken`] and released later from
//! a different execution context.
//!
//! Reentrancy is tracked by a [`LockContext`] that the caller threads
//! through its call chain, per pair. Tiers inherited from an enclosing
//! operation are skipped; tiers the same context already holds on that
//! pair are refused.

use parking_lot::lock_api::{RawRwLock as _, RawRwLockDowngrade as _};
use parking_lot::{Mutex, RawRwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FsError, FsResult};
use crate::LockFlags;

const ACQUIRE_ORDER: [LockFlags; 2] = [LockFlags::CONTENT, LockFlags::PAGING_IO];
const RELEASE_ORDER: [LockFlags; 2] = [LockFlags::PAGING_IO, LockFlags::CONTENT];

/// Logical owner of a lock hold, independent of the thread that took it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(pub u64);

impl OwnerToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, Default)]
struct Tiers {
    inherited: LockFlags,
    shared: LockFlags,
    exclusive: LockFlags,
}

impl Tiers {
    fn held(&self) -> LockFlags {
        self.shared | self.exclusive
    }

    fn is_empty(&self) -> bool {
        (self.inherited | self.held()).is_empty()
    }
}

/// Lock tiers held by one logical operation, tracked per [`LockPair`].
///
/// An operation may lock several pairs (rename touches two nodes); holds on
/// one pair never satisfy or conflict with requests on another.
#[derive(Debug, Default)]
pub struct LockContext {
    pairs: Vec<(PairId, Tiers)>,
}

impl LockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for an operation issued while this one is in progress. Every
    /// tier held here counts as already acquired there, on the same pair.
    pub fn nested(&self) -> Self {
        let pairs = self
            .pairs
            .iter()
            .map(|(id, t)| {
                let inherited = Tiers {
                    inherited: t.inherited | t.held(),
                    ..Tiers::default()
                };
                (*id, inherited)
            })
            .collect();
        Self { pairs }
    }

    /// Tiers of `pair` held by this context itself.
    pub fn held(&self, pair: &LockPair) -> LockFlags {
        self.tiers(pair.id).held()
    }

    pub fn inherited(&self, pair: &LockPair) -> LockFlags {
        self.tiers(pair.id).inherited
    }

    /// True when no pair has a tier acquired through this context.
    pub fn holds_nothing(&self) -> bool {
        self.pairs.iter().all(|(_, t)| t.held().is_empty())
    }

    pub fn holds_exclusive(&self, pair: &LockPair, flags: LockFlags) -> bool {
        let t = self.tiers(pair.id);
        (t.exclusive | t.inherited).contains(flags)
    }

    pub fn holds(&self, pair: &LockPair, flags: LockFlags) -> bool {
        let t = self.tiers(pair.id);
        (t.held() | t.inherited).contains(flags)
    }

    fn tiers(&self, id: PairId) -> Tiers {
        self.pairs
            .iter()
            .find(|(p, _)| *p == id)
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }

    fn tiers_mut(&mut self, id: PairId) -> &mut Tiers {
        let idx = match self.pairs.iter().position(|(p, _)| *p == id) {
            Some(idx) => idx,
            None => {
                self.pairs.push((id, Tiers::default()));
                self.pairs.len() - 1
            }
        };
        &mut self.pairs[idx].1
    }

    fn claim(&self, id: PairId, flags: LockFlags) -> FsResult<LockFlags> {
        let t = self.tiers(id);
        let flags = flags - t.inherited;
        let again = flags & t.held();
        if !again.is_empty() {
            return Err(FsError::LockReentrancy(again));
        }
        Ok(flags)
    }

    fn owned(&self, id: PairId, flags: LockFlags) -> FsResult<LockFlags> {
        let t = self.tiers(id);
        let flags = flags - t.inherited;
        let missing = flags - t.held();
        if !missing.is_empty() {
            return Err(FsError::LockNotHeld(missing));
        }
        Ok(flags)
    }

    fn mode_of(&self, id: PairId, tier: LockFlags) -> Mode {
        if self.tiers(id).exclusive.contains(tier) {
            Mode::Exclusive
        } else {
            Mode::Shared
        }
    }

    fn record(&mut self, id: PairId, flags: LockFlags, mode: Mode) {
        if flags.is_empty() {
            return;
        }
        let t = self.tiers_mut(id);
        match mode {
            Mode::Shared => t.shared |= flags,
            Mode::Exclusive => t.exclusive |= flags,
        }
    }

    fn downgrade(&mut self, id: PairId, flags: LockFlags) {
        let t = self.tiers_mut(id);
        t.exclusive -= flags;
        t.shared |= flags;
    }

    fn forget(&mut self, id: PairId, flags: LockFlags) {
        let t = self.tiers_mut(id);
        t.shared -= flags;
        t.exclusive -= flags;
        self.pairs.retain(|(_, t)| !t.is_empty());
    }
}

impl Drop for LockContext {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.holds_nothing(),
                "lock context dropped while holding tiers: {:?}",
                self.pairs
            );
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PairId(u64);

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ParkedHold {
    owner: OwnerToken,
    tier: LockFlags,
    mode: Mode,
}

pub struct LockPair {
    id: PairId,
    content: RawRwLock,
    paging_io: RawRwLock,
    parked: Mutex<Vec<ParkedHold>>,
}

impl Default for LockPair {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockPair")
            .field("id", &self.id.0)
            .field("content_locked", &self.content.is_locked())
            .field("paging_io_locked", &self.paging_io.is_locked())
            .finish()
    }
}

impl LockPair {
    pub fn new() -> Self {
        Self {
            id: PairId(NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed)),
            content: RawRwLock::INIT,
            paging_io: RawRwLock::INIT,
            parked: Mutex::new(Vec::new()),
        }
    }

    fn tier(&self, tier: LockFlags) -> &RawRwLock {
        if tier == LockFlags::CONTENT {
            &self.content
        } else {
            &self.paging_io
        }
    }

    pub fn is_locked(&self, tier: LockFlags) -> bool {
        ACQUIRE_ORDER
            .iter()
            .filter(|t| tier.contains(**t))
            .any(|t| self.tier(*t).is_locked())
    }

    pub fn is_locked_exclusive(&self, tier: LockFlags) -> bool {
        ACQUIRE_ORDER
            .iter()
            .filter(|t| tier.contains(**t))
            .any(|t| self.tier(*t).is_locked_exclusive())
    }

    pub fn acquire_shared(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        let flags = ctx.claim(self.id, flags)?;
        for tier in ACQUIRE_ORDER.iter().filter(|t| flags.contains(**t)) {
            self.tier(*tier).lock_shared();
        }
        ctx.record(self.id, flags, Mode::Shared);
        Ok(())
    }

    pub fn acquire_exclusive(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        let flags = ctx.claim(self.id, flags)?;
        for tier in ACQUIRE_ORDER.iter().filter(|t| flags.contains(**t)) {
            self.tier(*tier).lock_exclusive();
        }
        ctx.record(self.id, flags, Mode::Exclusive);
        Ok(())
    }

    /// Non-blocking acquire. `Ok(false)` leaves nothing held.
    pub fn try_acquire_shared(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<bool> {
        let flags = ctx.claim(self.id, flags)?;
        let acquired = self.try_acquire(flags, Mode::Shared);
        if acquired {
            ctx.record(self.id, flags, Mode::Shared);
        }
        Ok(acquired)
    }

    /// Non-blocking acquire. `Ok(false)` leaves nothing held.
    pub fn try_acquire_exclusive(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
    ) -> FsResult<bool> {
        let flags = ctx.claim(self.id, flags)?;
        let acquired = self.try_acquire(flags, Mode::Exclusive);
        if acquired {
            ctx.record(self.id, flags, Mode::Exclusive);
        }
        Ok(acquired)
    }

    fn try_acquire(&self, flags: LockFlags, mode: Mode) -> bool {
        let try_tier = |tier: LockFlags| match mode {
            Mode::Shared => self.tier(tier).try_lock_shared(),
            Mode::Exclusive => self.tier(tier).try_lock_exclusive(),
        };

        if flags.contains(LockFlags::CONTENT) && !try_tier(LockFlags::CONTENT) {
            return false;
        }
        if flags.contains(LockFlags::PAGING_IO) && !try_tier(LockFlags::PAGING_IO) {
            if flags.contains(LockFlags::CONTENT) {
                // SAFETY: Content was acquired in `mode` just above.
                unsafe { self.unlock_tier(LockFlags::CONTENT, mode) };
            }
            return false;
        }
        true
    }

    /// Downgrade exclusive holds to shared without releasing them.
    pub fn convert_exclusive_to_shared(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
    ) -> FsResult<()> {
        let tiers = ctx.tiers(self.id);
        let flags = flags - tiers.inherited;
        let missing = flags - tiers.exclusive;
        if !missing.is_empty() {
            return Err(FsError::LockNotHeld(missing));
        }
        for tier in RELEASE_ORDER.iter().filter(|t| flags.contains(**t)) {
            // SAFETY: the context records an exclusive hold on this tier.
            unsafe { self.tier(*tier).downgrade() };
        }
        ctx.downgrade(self.id, flags);
        Ok(())
    }

    pub fn release(&self, flags: LockFlags, ctx: &mut LockContext) -> FsResult<()> {
        let flags = ctx.owned(self.id, flags)?;
        for tier in RELEASE_ORDER.iter().filter(|t| flags.contains(**t)) {
            // SAFETY: the context records a hold on this tier in this mode.
            unsafe { self.unlock_tier(*tier, ctx.mode_of(self.id, *tier)) };
        }
        ctx.forget(self.id, flags);
        Ok(())
    }

    /// Hand the tiers this context holds over to `owner`. The context no
    /// longer holds them afterwards; [`LockPair::release_owner`] with the
    /// same token releases them from any context.
    pub fn set_owner(
        &self,
        flags: LockFlags,
        ctx: &mut LockContext,
        owner: OwnerToken,
    ) -> FsResult<()> {
        let flags = ctx.owned(self.id, flags)?;
        let mut parked = self.parked.lock();
        for tier in ACQUIRE_ORDER.iter().filter(|t| flags.contains(**t)) {
            parked.push(ParkedHold {
                owner,
                tier: *tier,
                mode: ctx.mode_of(self.id, *tier),
            });
        }
        ctx.forget(self.id, flags);
        Ok(())
    }

    /// Release tiers held either by `ctx` itself or parked under `owner`.
    pub fn release_owner(
        &self,
        flags: LockFlags,
        owner: OwnerToken,
        ctx: &mut LockContext,
    ) -> FsResult<()> {
        let tiers = ctx.tiers(self.id);
        let flags = flags - tiers.inherited;
        let mut parked = self.parked.lock();

        let mut plan = Vec::with_capacity(2);
        let mut missing = LockFlags::empty();
        for tier in RELEASE_ORDER.iter().filter(|t| flags.contains(**t)) {
            if tiers.held().contains(*tier) {
                plan.push((*tier, ctx.mode_of(self.id, *tier), None));
            } else if let Some(idx) =
                parked.iter().position(|p| p.owner == owner && p.tier == *tier)
            {
                plan.push((*tier, parked[idx].mode, Some(idx)));
            } else {
                missing |= *tier;
            }
        }
        if !missing.is_empty() {
            return Err(FsError::LockNotHeld(missing));
        }

        // Highest index first so the remaining indices stay valid.
        let mut parked_indices: Vec<usize> = plan.iter().filter_map(|p| p.2).collect();
        parked_indices.sort_unstable_by(|a, b| b.cmp(a));
        for idx in parked_indices {
            parked.swap_remove(idx);
        }
        drop(parked);

        for (tier, mode, from_parked) in plan {
            // SAFETY: the hold was recorded either in the context or under
            // the owner token, in `mode`.
            unsafe { self.unlock_tier(tier, mode) };
            if from_parked.is_none() {
                ctx.forget(self.id, tier);
            }
        }
        Ok(())
    }

    /// # Safety
    /// `tier` must currently be held in `mode` by the caller's logical owner.
    unsafe fn unlock_tier(&self, tier: LockFlags, mode: Mode) {
        match mode {
            Mode::Shared => unsafe { self.tier(tier).unlock_shared() },
            Mode::Exclusive => unsafe { self.tier(tier).unlock_exclusive() },
        }
    }
}
