//! # Pool Configuration
//!
//! Pools are sized once at startup, usually from a TOML file:
//!
//! ```toml
//! block_size = 64
//! blocks_per_page = 128
//! stamp_signatures = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Blocks per page when a config file leaves it out.
pub const DEFAULT_BLOCKS_PER_PAGE: usize = 64;

const fn default_blocks_per_page() -> usize {
    DEFAULT_BLOCKS_PER_PAGE
}

const fn default_stamp_signatures() -> bool {
    cfg!(debug_assertions)
}

/// Configuration for one segmented pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Bytes of user data per block.
    pub block_size: usize,
    /// Blocks carved out of every page.
    #[serde(default = "default_blocks_per_page")]
    pub blocks_per_page: usize,
    /// Stamp allocated/unallocated signatures into user data on every
    /// allocate and deallocate. Guard bytes are checked regardless.
    #[serde(default = "default_stamp_signatures")]
    pub stamp_signatures: bool,
}

impl PoolConfig {
    /// Creates a config with signature stamping on in debug builds only.
    #[must_use]
    pub const fn new(block_size: usize, blocks_per_page: usize) -> Self {
        Self {
            block_size,
            blocks_per_page,
            stamp_signatures: default_stamp_signatures(),
        }
    }

    /// Overrides signature stamping.
    #[must_use]
    pub const fn with_signatures(mut self, enabled: bool) -> Self {
        self.stamp_signatures = enabled;
        self
    }

    /// Checks that both sizes are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> PoolResult<()> {
        if self.block_size == 0 {
            return Err(PoolError::InvalidConfig(
                "block_size must be greater than zero".into(),
            ));
        }
        if self.blocks_per_page == 0 {
            return Err(PoolError::InvalidConfig(
                "blocks_per_page must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] on malformed TOML or bad values.
    pub fn from_toml_str(text: &str) -> PoolResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the file cannot be read or parsed.
    pub fn from_toml(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PoolError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}
