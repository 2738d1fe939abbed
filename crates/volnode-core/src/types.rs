// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the volume node registry

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Flush offset meaning "up to the current end of file".
pub const WRITE_TO_END_OF_FILE: u64 = u64::MAX;

/// Internal node identifier, also used as the section key for the cache engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque reference to an item held by a [`crate::MetaCache`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheItemId(pub u64);

bitflags! {
    /// Access rights granted to an open handle
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GrantedAccess: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const EXECUTE = 0x0000_0020;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
    }
}

impl GrantedAccess {
    /// Rights that participate in share reservation as "read"
    pub const READ_LIKE: Self = Self::READ_DATA.union(Self::EXECUTE);
    /// Rights that participate in share reservation as "write"
    pub const WRITE_LIKE: Self = Self::WRITE_DATA.union(Self::APPEND_DATA);
    /// Rights that conflict with another handle's user-writable mapping
    pub const DATA_ACCESS: Self = Self::READ_LIKE.union(Self::WRITE_LIKE).union(Self::DELETE);
}

bitflags! {
    /// Sharing a handle grants to later openers of the same node
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShareMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const DELETE = 0x4;
    }
}

bitflags! {
    /// Lock tiers of a file node
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LockFlags: u32 {
        const CONTENT = 0x1;
        const PAGING_IO = 0x2;
        const FULL = Self::CONTENT.bits() | Self::PAGING_IO.bits();
    }
}

bitflags! {
    /// Per-open-instance flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FileObjectFlags: u32 {
        /// The handle goes through the byte-range cache
        const CACHE_SUPPORTED = 0x1;
    }
}

/// Cached file metadata as exchanged with the backing file system.
///
/// Times are 100ns intervals since 1601-01-01, as the backing implementation
/// reports them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_attributes: u32,
    pub reparse_tag: u32,
    pub allocation_size: u64,
    pub file_size: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
}

/// Sizes propagated into a handle's cache map
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileSizes {
    pub allocation_size: u64,
    pub file_size: u64,
    pub valid_data_length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_access_covers_read_write_delete() {
        assert!(GrantedAccess::DATA_ACCESS.contains(GrantedAccess::EXECUTE));
        assert!(GrantedAccess::DATA_ACCESS.contains(GrantedAccess::APPEND_DATA));
        assert!(GrantedAccess::DATA_ACCESS.contains(GrantedAccess::DELETE));
        assert!(!GrantedAccess::DATA_ACCESS.contains(GrantedAccess::READ_ATTRIBUTES));
    }

    #[test]
    fn full_lock_is_both_tiers() {
        assert_eq!(LockFlags::FULL, LockFlags::CONTENT | LockFlags::PAGING_IO);
    }
}
