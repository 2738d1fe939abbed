// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the volume node registry

use std::io;

use crate::LockFlags;

/// Core registry error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("insufficient resources")]
    ResourceExhausted,
    #[error("delete pending")]
    DeletePending,
    #[error("sharing violation")]
    SharingViolation,
    #[error("invalid file name")]
    InvalidName,
    #[error("lock tiers {0:?} already held by this operation")]
    LockReentrancy(LockFlags),
    #[error("lock tiers {0:?} not held")]
    LockNotHeld(LockFlags),
    #[error("cache engine: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type FsResult<T> = Result<T, FsError>;

/// Failures reported by the byte-range cache engine
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Pages are locked for in-flight I/O; the data will be written regardless.
    #[error("cache pages locked")]
    PagesLocked,
    #[error("no space left")]
    NoSpace,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Engine(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
