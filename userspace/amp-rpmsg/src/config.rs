// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transport buffer sizing, loadable from TOML.
//!
//! ```toml
//! h2r_buf_size = 512
//! r2h_buf_size = 512
//! split_shpool = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::wire::RPMSG_HEADER_SIZE;
use crate::RPMSG_BUFFER_SIZE;

/// Smallest buffer that can carry a header and a parked reclaim record.
pub const RPMSG_MIN_BUFFER_SIZE: u32 = 32;
/// Largest buffer whose payload length still fits the 16-bit header field.
pub const RPMSG_MAX_BUFFER_SIZE: u32 = u16::MAX as u32 + RPMSG_HEADER_SIZE as u32;

/// Errors loading or validating an `RpmsgConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read rpmsg config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse rpmsg config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A buffer size is out of range.
    #[error("{field} = {size} outside {min}..={max}")]
    BufferSize {
        /// Offending key.
        field: &'static str,
        /// Configured value.
        size: u32,
        /// Lower bound.
        min: u32,
        /// Upper bound.
        max: u32,
    },
    /// A buffer size is not a multiple of 8.
    #[error("{field} = {size} is not a multiple of 8")]
    Unaligned {
        /// Offending key.
        field: &'static str,
        /// Configured value.
        size: u32,
    },
}

fn default_buf_size() -> u32 {
    RPMSG_BUFFER_SIZE
}

/// Buffer sizing of one rpmsg channel, seen from the driver (host) side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpmsgConfig {
    /// Size of host-to-remote buffers, header included.
    #[serde(default = "default_buf_size")]
    pub h2r_buf_size: u32,
    /// Size of remote-to-host buffers, header included.
    #[serde(default = "default_buf_size")]
    pub r2h_buf_size: u32,
    /// Give each direction its own half of the pool instead of sharing one.
    #[serde(default)]
    pub split_shpool: bool,
}

impl Default for RpmsgConfig {
    fn default() -> Self {
        Self { h2r_buf_size: RPMSG_BUFFER_SIZE, r2h_buf_size: RPMSG_BUFFER_SIZE, split_shpool: false }
    }
}

impl RpmsgConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: RpmsgConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Checks both sizes against the transport limits and 8-byte granularity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, size) in [("h2r_buf_size", self.h2r_buf_size), ("r2h_buf_size", self.r2h_buf_size)]
        {
            if !(RPMSG_MIN_BUFFER_SIZE..=RPMSG_MAX_BUFFER_SIZE).contains(&size) {
                return Err(ConfigError::BufferSize {
                    field,
                    size,
                    min: RPMSG_MIN_BUFFER_SIZE,
                    max: RPMSG_MAX_BUFFER_SIZE,
                });
            }
            if size % 8 != 0 {
                return Err(ConfigError::Unaligned { field, size });
            }
        }
        Ok(())
    }
}
