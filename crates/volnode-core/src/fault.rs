// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Injected cache-engine failures
//!
//! A [`FaultPolicy`] is read from JSON (stress runs) or built inline (tests)
//! and installed on the [`FaultInjector`] owned by `MemCacheEngine`. Rules
//! are matched in order against each engine call; the first armed rule for
//! the call decides the failure.

use std::io;

use libc::EIO;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CacheError;

/// Cache-engine calls a rule can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    /// Legacy flush of a section range
    Flush,
    /// Legacy purge; an injected fault makes the purge report failure
    Purge,
    /// Combined flush-and-purge on coherency-capable engines
    CoherencyFlush,
    /// Cache-map size update from `set_file_info`
    SetFileSizes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
    PagesLocked,
}

impl From<FaultErrno> for CacheError {
    fn from(errno: FaultErrno) -> Self {
        match errno {
            FaultErrno::Eio => CacheError::Io(io::Error::from_raw_os_error(EIO)),
            FaultErrno::Enospc => CacheError::NoSpace,
            FaultErrno::PagesLocked => CacheError::PagesLocked,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Matching calls let through before the rule arms.
    #[serde(default)]
    pub start_after: u64,
    /// Cap on failures injected by this rule; unlimited when absent.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            op: FaultOp::Flush,
            errno: FaultErrno::Eio,
            start_after: 0,
            max_faults: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// What the installed policy did so far, for run reports.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FaultPolicySummary {
    pub enabled: bool,
    pub active: bool,
    pub rule_count: usize,
    pub injected: u64,
}

#[derive(Debug)]
struct ArmedRule {
    rule: FaultRule,
    calls: u64,
    injected: u64,
}

impl ArmedRule {
    /// Count one matching call; true when this call must fail.
    fn on_call(&mut self) -> bool {
        self.calls = self.calls.saturating_add(1);
        let exhausted = self.rule.max_faults.is_some_and(|max| self.injected >= max);
        if self.calls <= self.rule.start_after || exhausted {
            return false;
        }
        self.injected += 1;
        true
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    enabled: bool,
    rules: Vec<ArmedRule>,
}

#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<InjectorState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the policy; counters start over.
    pub fn set_policy(&self, policy: FaultPolicy) {
        let rules = policy
            .rules
            .into_iter()
            .map(|rule| ArmedRule {
                rule,
                calls: 0,
                injected: 0,
            })
            .collect();
        *self.state.lock() = InjectorState {
            enabled: policy.enabled,
            rules,
        };
    }

    pub fn summary(&self) -> FaultPolicySummary {
        let state = self.state.lock();
        FaultPolicySummary {
            enabled: state.enabled,
            active: state.enabled && !state.rules.is_empty(),
            rule_count: state.rules.len(),
            injected: state.rules.iter().map(|r| r.injected).sum(),
        }
    }

    /// Error to return from the engine call `op`, if a rule fires.
    pub fn should_fault(&self, op: FaultOp) -> Option<CacheError> {
        let mut state = self.state.lock();
        if !state.enabled {
            return None;
        }
        let errno = state
            .rules
            .iter_mut()
            .filter(|armed| armed.rule.op == op)
            .find_map(|armed| armed.on_call().then_some(armed.rule.errno))?;
        drop(state);

        debug!(target: "volnode::cache", ?op, ?errno, "injected cache fault");
        Some(errno.into())
    }
}
