//! Engine configuration.
//!
//! [`EngineConfig`] is built once (in code or from TOML), validated, and then
//! passed by reference into the pipeline entry points. It is never mutated
//! after construction; every recognized option is a named field below.
//!
//! ```
//! use geobeam::config::{EngineConfig, WriteStrategy};
//!
//! let cfg = EngineConfig::from_toml_str(r#"
//!     partitions = 8
//!     tile_width = 128
//!     tile_height = 128
//!     window_size = 100000
//!     write_strategy = "idempotent"
//! "#)?;
//! assert_eq!(cfg.partitions, 8);
//! assert_eq!(cfg.write_strategy, WriteStrategy::Idempotent);
//! # Ok::<(), geobeam::EnrichError>(())
//! ```

use crate::error::{EnrichError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the orchestrator commits each window's output to the result store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Add a new part per window. Re-running a window duplicates its rows.
    Append,
    /// One part file per window; a retry replaces that window's part.
    Idempotent,
}

/// Immutable engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker threads for the execution context. `None` uses one per CPU.
    pub threads: Option<usize>,
    /// Number of partitions point datasets are split into.
    pub partitions: usize,
    /// Tile width in pixels used by the tile indexer.
    pub tile_width: usize,
    /// Tile height in pixels used by the tile indexer.
    pub tile_height: usize,
    /// Trip ids per orchestrator window.
    pub window_size: i64,
    /// Fraction of working memory available to transforms. Informational
    /// for the in-process runtime; validated together with the storage fraction.
    pub executor_memory_fraction: f64,
    /// Fraction of working memory reserved for decoded reference data.
    /// Bounds how many decoded tiles one partition keeps cached.
    pub storage_memory_fraction: f64,
    /// Drop tiles whose pixels are all nodata; points inside them sample as null.
    pub skip_empty_tiles: bool,
    /// Commit strategy for window outputs.
    pub write_strategy: WriteStrategy,
    /// Retries per window before the failure is surfaced.
    pub max_window_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            partitions: 2 * num_cpus::get().max(2),
            tile_width: 256,
            tile_height: 256,
            window_size: 1_000_000,
            executor_memory_fraction: 0.6,
            storage_memory_fraction: 0.3,
            skip_empty_tiles: false,
            write_strategy: WriteStrategy::Idempotent,
            max_window_retries: 2,
        }
    }
}

/// Tiles kept per partition when the whole storage fraction is available.
const FULL_TILE_CACHE: usize = 64;

impl EngineConfig {
    /// Parse and validate a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| EnrichError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse, and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EnrichError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check option ranges. Called by every constructor that parses input and
    /// by [`ExecutionContext::acquire`](crate::context::ExecutionContext::acquire).
    pub fn validate(&self) -> Result<()> {
        let fail = |m: String| Err(EnrichError::Config(m));
        if self.partitions == 0 {
            return fail("partitions must be at least 1".into());
        }
        if self.threads == Some(0) {
            return fail("threads must be at least 1 when set".into());
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return fail(format!(
                "tile size must be positive, got {}x{}",
                self.tile_width, self.tile_height
            ));
        }
        if self.window_size <= 0 {
            return fail(format!("window_size must be positive, got {}", self.window_size));
        }
        for (name, v) in [
            ("executor_memory_fraction", self.executor_memory_fraction),
            ("storage_memory_fraction", self.storage_memory_fraction),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return fail(format!("{name} must be in (0, 1], got {v}"));
            }
        }
        if self.executor_memory_fraction + self.storage_memory_fraction > 1.0 + f64::EPSILON {
            return fail("memory fractions must not sum to more than 1".into());
        }
        Ok(())
    }

    /// Maximum number of decoded tiles a partition caches while sampling.
    pub fn tile_cache_capacity(&self) -> usize {
        ((FULL_TILE_CACHE as f64 * self.storage_memory_fraction).ceil() as usize).max(1)
    }
}
