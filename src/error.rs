//! Error types surfaced by the enrichment engine.
//!
//! Only failures that make a run meaningless are errors. A point outside every
//! reference geometry, or a raster value missing from a classification table,
//! is absorbed as a null / `"Unknown"` and counted in
//! [`MatchStats`](crate::matcher::MatchStats) instead.

use crate::window::KeyRange;
use std::fmt;
use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    Tile,
    Match,
    Merge,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Load => "load",
            Stage::Tile => "tile",
            Stage::Match => "match",
            Stage::Merge => "merge",
            Stage::Write => "write",
        };
        f.write_str(s)
    }
}

/// Errors produced by the enrichment engine.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// A reference layer could not be parsed or its CRS is unsupported. Fatal.
    #[error("reference load error ({layer}): {message}")]
    ReferenceLoad {
        /// Layer name or path.
        layer: String,
        /// What went wrong.
        message: String,
    },

    /// A raster could not be decoded, or its encoding is not accepted. Fatal.
    #[error("raster format error: {message}")]
    RasterFormat {
        /// What went wrong.
        message: String,
    },

    /// A window's output could not be written to the result store. Retryable.
    #[error("window {window} append failed: {source}")]
    WindowAppend {
        /// Window being written.
        window: KeyRange,
        /// Underlying IO error.
        #[source]
        source: anyhow::Error,
    },

    /// Configuration was rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A failure attributed to a stage and, when windowed, the key range in progress.
    #[error("stage `{stage}` failed{}: {source}", .window.map(|w| format!(" in window {w}")).unwrap_or_default())]
    Stage {
        /// Stage that failed.
        stage: Stage,
        /// Window in progress, if any.
        window: Option<KeyRange>,
        /// Root cause.
        #[source]
        source: Box<EnrichError>,
    },

    /// Any other failure, annotated with context by the caller.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EnrichError {
    pub(crate) fn reference_load(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ReferenceLoad {
            layer: layer.into(),
            message: message.into(),
        }
    }

    pub(crate) fn raster_format(message: impl Into<String>) -> Self {
        Self::RasterFormat {
            message: message.into(),
        }
    }

    /// Attribute this error to `stage` (and optionally a window).
    ///
    /// Errors that already carry a stage are returned unchanged.
    #[must_use]
    pub fn at(self, stage: Stage, window: Option<KeyRange>) -> Self {
        match self {
            already @ Self::Stage { .. } => already,
            other => Self::Stage {
                stage,
                window,
                source: Box::new(other),
            },
        }
    }

    /// Stage this error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Window in progress when this error occurred, if any.
    #[must_use]
    pub fn window(&self) -> Option<KeyRange> {
        match self {
            Self::Stage { window, .. } => *window,
            Self::WindowAppend { window, .. } => Some(*window),
            _ => None,
        }
    }

    /// Whether retrying the failed window may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WindowAppend { .. } => true,
            Self::Stage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias used across the engine.
pub type Result<T, E = EnrichError> = std::result::Result<T, E>;
