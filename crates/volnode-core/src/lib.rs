// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory file-node registry and concurrency manager for a volume layer
//!
//! One [`FileNode`] exists per open file name on a [`Volume`]. Handles are
//! registered through [`Volume::open`], torn down in three steps
//! ([`Volume::cleanup`], [`Volume::cleanup_complete`], [`Volume::close`]),
//! and serialised against each other through the node's two-tier
//! [`LockPair`].

pub mod cache;
pub mod config;
pub mod error;
pub mod fault;
pub mod file_desc;
pub mod file_node;
mod live;
pub mod lock_pair;
pub mod meta_cache;
pub mod name_table;
pub mod share_access;
pub mod types;
pub mod volume;

#[cfg(test)]
mod registry_tests;
pub mod testing;

pub use cache::{CacheEngine, MemCacheEngine, SectionStats};
pub use config::{VolumeConfig, VolumeLimits, INFINITE_TIMEOUT_MS};
pub use error::{CacheError, CacheResult, FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultPolicySummary, FaultRule};
pub use file_desc::{FileDesc, FileObject};
pub use file_node::FileNode;
pub use lock_pair::{LockContext, LockPair, OwnerToken};
pub use meta_cache::{MemMetaCache, MetaCache};
pub use name_table::{NameTable, OrderedNameTable, PATH_SEPARATOR};
pub use share_access::{ShareAccess, ShareReservation};
pub use types::*;
pub use volume::{TableGuard, Volume};
