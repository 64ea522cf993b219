//! Tree configuration module.
//!
//! This module provides the configuration of a B-tree instance and the startup
//! check that a page can hold the largest permitted record.
//!
//! # Environment Variables
//!
//! `TreeConfig::from_env()` overlays these on the defaults:
//!
//! - `COWTREE_PAGE_SIZE`: page size in bytes (default: `4096`)
//! - `COWTREE_MIN_FILL_PERCENT`: occupancy below which a page is merged or
//!   rebalanced after a delete, as a percentage of the page size (default: `25`)
//!
//! # Invariants
//!
//! - A validated config always satisfies
//!   `HEADER + 8 + 2 + 4 + MAX_KEY_SIZE + MAX_VAL_SIZE <= page_size`
//! - `page_size <= MAX_PAGE_SIZE`, so relative record offsets of a page that
//!   overflowed by one record still fit in 16 bits
//! - `min_fill_percent` is in `1..=49`, so two underfull siblings always merge

use crate::btree::codec::MAX_SINGLE_RECORD_PAGE;
use crate::storage::DEFAULT_PAGE_SIZE;

/// Configuration of a B-tree instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Size of every page in bytes. Fixed for the lifetime of a tree.
    pub page_size: usize,
    /// A non-root page whose encoded size is below this percentage of
    /// `page_size` is merged with or refilled from a sibling.
    pub min_fill_percent: u8,
}

/// Error returned when a configuration is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A page cannot hold a single maximum-size record.
    PageTooSmall { page_size: usize, required: usize },
    /// Relative offsets would not fit in 16 bits.
    PageTooLarge { page_size: usize, max: usize },
    /// The fill threshold is outside `1..=49`.
    InvalidFillPercent(u8),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PageTooSmall {
                page_size,
                required,
            } => write!(
                f,
                "page size {page_size} cannot hold a maximum-size record ({required} bytes required)"
            ),
            Self::PageTooLarge { page_size, max } => {
                write!(f, "page size {page_size} exceeds the maximum of {max}")
            }
            Self::InvalidFillPercent(p) => {
                write!(f, "minimum fill percent {p} must be between 1 and 49")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            min_fill_percent: Self::DEFAULT_MIN_FILL_PERCENT,
        }
    }
}

impl TreeConfig {
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: usize = DEFAULT_PAGE_SIZE;
    /// Default underflow threshold (a quarter of a page).
    pub const DEFAULT_MIN_FILL_PERCENT: u8 = 25;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: usize = 32 * 1024;

    /// Create a config with an explicit page size and fill threshold.
    #[must_use]
    pub const fn new(page_size: usize, min_fill_percent: u8) -> Self {
        Self {
            page_size,
            min_fill_percent,
        }
    }

    /// Check that the config can back a tree.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a page cannot hold one record with a maximum-size key and value
    /// - `page_size` exceeds `MAX_PAGE_SIZE`
    /// - `min_fill_percent` is outside `1..=49`
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < MAX_SINGLE_RECORD_PAGE {
            return Err(ConfigError::PageTooSmall {
                page_size: self.page_size,
                required: MAX_SINGLE_RECORD_PAGE,
            });
        }
        if self.page_size > Self::MAX_PAGE_SIZE {
            return Err(ConfigError::PageTooLarge {
                page_size: self.page_size,
                max: Self::MAX_PAGE_SIZE,
            });
        }
        if self.min_fill_percent == 0 || self.min_fill_percent >= 50 {
            return Err(ConfigError::InvalidFillPercent(self.min_fill_percent));
        }
        Ok(())
    }

    /// Encoded size in bytes below which a non-root page is underfull.
    #[must_use]
    pub const fn min_fill_bytes(&self) -> usize {
        self.page_size * self.min_fill_percent as usize / 100
    }

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but unparsable, or if the
    /// resulting config fails `validate`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            page_size: Self::load_page_size()?,
            min_fill_percent: Self::load_min_fill_percent()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the page size from environment.
    ///
    /// Returns the default if not set.
    fn load_page_size() -> Result<usize, ConfigError> {
        match std::env::var("COWTREE_PAGE_SIZE") {
            Ok(value) => value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: "COWTREE_PAGE_SIZE".to_string(),
                message: format!("'{value}' is not a valid page size"),
            }),
            Err(_) => Ok(Self::DEFAULT_PAGE_SIZE),
        }
    }

    /// Load the minimum fill percentage from environment.
    ///
    /// Returns the default if not set.
    fn load_min_fill_percent() -> Result<u8, ConfigError> {
        match std::env::var("COWTREE_MIN_FILL_PERCENT") {
            Ok(value) => value.parse::<u8>().map_err(|_| ConfigError::InvalidValue {
                name: "COWTREE_MIN_FILL_PERCENT".to_string(),
                message: format!("'{value}' is not a valid percentage"),
            }),
            Err(_) => Ok(Self::DEFAULT_MIN_FILL_PERCENT),
        }
    }
}
