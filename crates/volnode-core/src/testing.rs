// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only fixtures for driving a volume through full handle lifecycles

#[cfg(test)]
pub mod fixtures;
