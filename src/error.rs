//! Error types for the segmentation pipeline.
//!
//! Every stage validates its inputs at entry and returns one of these
//! instead of producing a partially-correct table. Nothing here is retried.

use polars::prelude::PolarsError;
use thiserror::Error;

/// Result type alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Broad category of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: missing column, unparseable date or flag.
    InputFormat,
    /// A label remap table did not cover an observed value.
    UnmappedCategory,
    /// A stage was called before the stage it depends on.
    Precondition,
    /// Not enough distinct rows for the requested cluster count.
    InsufficientData,
    /// A configuration parameter is out of range.
    InvalidConfig,
    /// Failure inside the clustering engine or an I/O layer.
    Internal,
}

/// Unified error type for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{table}: missing required column `{column}`")]
    MissingColumn { table: &'static str, column: String },

    #[error("cannot parse `{value}` as a calendar date")]
    InvalidDate { value: String },

    #[error("invalid value `{value}` in column `{column}`")]
    InvalidValue { column: String, value: String },

    #[error("no display label for funnel step `{value}`")]
    UnmappedCategory { value: String },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("cannot fit {requested} clusters on {available} distinct feature rows")]
    InsufficientData { requested: usize, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn missing_column(table: &'static str, column: impl Into<String>) -> Self {
        Self::MissingColumn {
            table,
            column: column.into(),
        }
    }

    pub fn invalid_value(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Get the error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingColumn { .. } | Self::InvalidDate { .. } | Self::InvalidValue { .. } => {
                ErrorKind::InputFormat
            }
            Self::UnmappedCategory { .. } => ErrorKind::UnmappedCategory,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Clustering(_) | Self::Polars(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}
