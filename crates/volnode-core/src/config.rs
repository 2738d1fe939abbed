// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume parameters consumed by the node registry

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Metadata timeout value meaning "cached metadata never expires"
pub const INFINITE_TIMEOUT_MS: u32 = u32::MAX;

/// Resource ceilings enforced at node and descriptor creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeLimits {
    pub max_file_nodes: usize,
    pub max_open_handles: usize,
    /// Longest accepted path, in bytes
    pub max_name_bytes: usize,
}

impl Default for VolumeLimits {
    fn default() -> Self {
        Self {
            max_file_nodes: 65536,
            max_open_handles: 65536,
            max_name_bytes: 65534,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub sector_size: u32,
    pub sectors_per_allocation_unit: u32,
    /// Validity of cached file metadata. `0` disables caching,
    /// [`INFINITE_TIMEOUT_MS`] never expires.
    pub file_info_timeout_ms: u32,
    pub security_timeout_ms: u32,
    pub security_cache_capacity: usize,
    pub case_sensitive: bool,
    pub limits: VolumeLimits,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            sector_size: 4096,
            sectors_per_allocation_unit: 1,
            file_info_timeout_ms: 1000,
            security_timeout_ms: 1000,
            security_cache_capacity: 1024,
            case_sensitive: true,
            limits: VolumeLimits::default(),
        }
    }
}

impl VolumeConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> FsResult<Self> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> FsResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| FsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_bytes(&bytes)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.sector_size == 0 || self.sectors_per_allocation_unit == 0 {
            return Err(FsError::Config(
                "sector_size and sectors_per_allocation_unit must be non-zero".into(),
            ));
        }
        if self.limits.max_name_bytes == 0 {
            return Err(FsError::Config("max_name_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Allocation granularity in bytes
    pub fn allocation_unit(&self) -> u64 {
        u64::from(self.sector_size) * u64::from(self.sectors_per_allocation_unit)
    }

    /// `None` means the timeout is infinite.
    pub fn file_info_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.file_info_timeout_ms)
    }

    pub fn security_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.security_timeout_ms)
    }
}

fn timeout_from_millis(ms: u32) -> Option<Duration> {
    (ms != INFINITE_TIMEOUT_MS).then(|| Duration::from_millis(u64::from(ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            VolumeConfig::from_json_bytes(br#"{ "sector_size": 512, "sectors_per_allocation_unit": 8 }"#)
                .expect("config");
        assert_eq!(config.allocation_unit(), 4096);
        assert_eq!(config.file_info_timeout_ms, 1000);
        assert!(config.case_sensitive);
        assert_eq!(config.limits, VolumeLimits::default());
    }

    #[test]
    fn zero_sector_size_is_rejected() {
        let err = VolumeConfig::from_json_bytes(br#"{ "sector_size": 0 }"#).unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[test]
    fn infinite_timeout_maps_to_none() {
        let config = VolumeConfig {
            file_info_timeout_ms: INFINITE_TIMEOUT_MS,
            ..VolumeConfig::default()
        };
        assert_eq!(config.file_info_timeout(), None);
        assert_eq!(
            VolumeConfig::default().file_info_timeout(),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "case_sensitive": false, "limits": {{ "max_file_nodes": 4 }} }}"#)
            .unwrap();
        let config = VolumeConfig::from_json_file(file.path()).unwrap();
        assert!(!config.case_sensitive);
        assert_eq!(config.limits.max_file_nodes, 4);
        assert_eq!(config.limits.max_open_handles, 65536);
    }
}
