// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Share reservations: aggregate read/write/delete sharing across the
//! handles of one node

use crate::error::{FsError, FsResult};
use crate::{GrantedAccess, ShareMode};

/// The reservation a single handle holds against its node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareReservation {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub shared_read: bool,
    pub shared_write: bool,
    pub shared_delete: bool,
}

impl ShareReservation {
    pub fn new(granted: GrantedAccess, share: ShareMode) -> Self {
        Self {
            read: granted.intersects(GrantedAccess::READ_LIKE),
            write: granted.intersects(GrantedAccess::WRITE_LIKE),
            delete: granted.contains(GrantedAccess::DELETE),
            shared_read: share.contains(ShareMode::READ),
            shared_write: share.contains(ShareMode::WRITE),
            shared_delete: share.contains(ShareMode::DELETE),
        }
    }

    /// Handles that request no data access never take part in sharing.
    pub fn is_active(&self) -> bool {
        self.read || self.write || self.delete
    }
}

/// Aggregate share state of a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShareAccess {
    pub open_count: u32,
    pub readers: u32,
    pub writers: u32,
    pub deleters: u32,
    pub shared_read: u32,
    pub shared_write: u32,
    pub shared_delete: u32,
}

impl ShareAccess {
    /// Returns `SharingViolation` when `requested` is incompatible with the
    /// handles already holding reservations.
    pub fn check(&self, requested: &ShareReservation) -> FsResult<()> {
        if !requested.is_active() {
            return Ok(());
        }

        let denied_by_existing = (requested.read && self.shared_read < self.open_count)
            || (requested.write && self.shared_write < self.open_count)
            || (requested.delete && self.shared_delete < self.open_count);
        let denies_existing = (self.readers != 0 && !requested.shared_read)
            || (self.writers != 0 && !requested.shared_write)
            || (self.deleters != 0 && !requested.shared_delete);

        if denied_by_existing || denies_existing {
            return Err(FsError::SharingViolation);
        }
        Ok(())
    }

    /// Check and, on success, record the reservation.
    pub fn check_and_update(&mut self, requested: &ShareReservation) -> FsResult<()> {
        self.check(requested)?;
        self.set(requested);
        Ok(())
    }

    /// Record a reservation without checking it.
    pub fn set(&mut self, reservation: &ShareReservation) {
        if !reservation.is_active() {
            return;
        }
        self.open_count += 1;
        self.readers += u32::from(reservation.read);
        self.writers += u32::from(reservation.write);
        self.deleters += u32::from(reservation.delete);
        self.shared_read += u32::from(reservation.shared_read);
        self.shared_write += u32::from(reservation.shared_write);
        self.shared_delete += u32::from(reservation.shared_delete);
    }

    pub fn remove(&mut self, reservation: &ShareReservation) {
        if !reservation.is_active() {
            return;
        }
        self.open_count = self.open_count.saturating_sub(1);
        self.readers = self.readers.saturating_sub(u32::from(reservation.read));
        self.writers = self.writers.saturating_sub(u32::from(reservation.write));
        self.deleters = self.deleters.saturating_sub(u32::from(reservation.delete));
        self.shared_read = self.shared_read.saturating_sub(u32::from(reservation.shared_read));
        self.shared_write = self.shared_write.saturating_sub(u32::from(reservation.shared_write));
        self.shared_delete =
            self.shared_delete.saturating_sub(u32::from(reservation.shared_delete));
    }
}
