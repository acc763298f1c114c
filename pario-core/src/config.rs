// vim: tw=80
//! Mount-time configuration

use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::{
    layout::LayoutAlgorithm,
    types::*,
};

/// Geometry of the files' parity groups
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    /// Data units per group, `N`
    pub data_units: u32,
    /// Parity units per group, `K`.  The group also reserves this many spares.
    pub parity_units: u32,
    /// Bytes per unit
    pub unit_size: u64,
    /// Bytes per page.  The granularity of buffers and of parity.
    pub page_size: u64,
    /// Number of devices in the pool
    pub pool_width: u32,
    pub algorithm: LayoutAlgorithm,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            data_units: 4,
            parity_units: 1,
            unit_size: 1 << 16,
            page_size: 4096,
            pool_width: 8,
            algorithm: LayoutAlgorithm::Linear
        }
    }
}

/// Settings for one mounted client
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub layout: LayoutConfig,
    /// Largest payload of a single protocol request
    pub max_fop_bytes: u64,
    /// Most segments in a single protocol request
    pub max_fop_segs: usize,
    /// How many times a transfer cycle may be re-sent after the pool changes
    /// under it
    pub max_stale_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            layout: LayoutConfig::default(),
            max_fop_bytes: 1 << 20,
            max_fop_segs: 256,
            max_stale_retries: 3
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())?;
        Config::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                tracing::warn!("invalid configuration: {}", e);
                Error::EINVAL
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that don't belong to the layout
    pub fn validate(&self) -> Result<()> {
        if self.max_fop_bytes < self.layout.page_size || self.max_fop_segs == 0
        {
            tracing::warn!(max_fop_bytes = self.max_fop_bytes,
                max_fop_segs = self.max_fop_segs,
                "a protocol request must fit at least one page");
            return Err(Error::EINVAL);
        }
        Ok(())
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn from_path() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"layout:\n  data_units: 6\n  parity_units: 2\n").unwrap();
        let config = Config::from_path(f.path()).unwrap();
        assert_eq!(config.layout.data_units, 6);
        assert_eq!(config.layout.parity_units, 2);
        assert_eq!(config.layout.page_size, 4096);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.yaml");
        assert_eq!(Config::from_path(path).unwrap_err(), Error::ENOENT);
    }

    #[test]
    fn partial() {
        let yaml = "
layout:
  data_units: 3
  unit_size: 12288
  pool_width: 5
  algorithm: rotating
max_stale_retries: 7
";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.layout.data_units, 3);
        assert_eq!(config.layout.parity_units, 1);
        assert_eq!(config.layout.unit_size, 12288);
        assert_eq!(config.layout.algorithm, LayoutAlgorithm::Rotating);
        assert_eq!(config.max_stale_retries, 7);
        assert_eq!(config.max_fop_segs, 256);
    }

    #[test]
    fn tiny_fop() {
        let yaml = "max_fop_bytes: 512";
        assert_eq!(Config::from_yaml(yaml).unwrap_err(), Error::EINVAL);
    }

    #[test]
    fn unknown_field() {
        let yaml = "max_fop_pages: 10";
        assert_eq!(Config::from_yaml(yaml).unwrap_err(), Error::EINVAL);
    }
}
// LCOV_EXCL_STOP
