/// Error taxonomy for LiveFilter
///
/// Errors are split by who is expected to handle them:
///
/// - `ConfigurationError`: the direct caller issued a malformed request. Fatal
///   to that call only; store state is untouched.
/// - `ComputeError`: a predicate evaluation failed. The store keeps its last
///   valid filtered set and reports the failure to opted-in listeners.
/// - `RoutingError`: a pop-out could not be completed. The chart is restored
///   locally and the error is returned to the initiating view.
/// - `TransportError`: the sync connection failed. Peer state is dropped and
///   local state stays authoritative.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("Column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Column '{column}' is {actual}, expected {expected}")]
    ColumnTypeMismatch {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Malformed predicate: {0}")]
    MalformedPredicate(String),

    #[error("Row index {index} out of range [0, {len})")]
    RowOutOfRange { index: usize, len: usize },

    #[error("Dimension '{0}' is not registered with this store")]
    DimensionNotRegistered(String),

    #[error("Dimension '{0}' belongs to a different store")]
    ForeignDimension(String),

    #[error("Data source '{0}' not found")]
    DataSourceNotFound(String),

    #[error("Duplicate data source '{0}'")]
    DuplicateDataSource(String),

    #[error("Chart '{0}' not found")]
    ChartNotFound(String),

    #[error("Duplicate chart '{0}'")]
    DuplicateChart(String),

    #[error("Invalid setting {key}={value}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    #[error("Dimension '{dimension}' failed at row {row}: {message}")]
    PredicateFailed {
        dimension: String,
        row: usize,
        message: String,
    },

    #[error("Evaluation aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    #[error("Chart '{0}' is not registered")]
    UnknownChart(String),

    #[error("Chart '{0}' is already popped out")]
    AlreadyPoppedOut(String),

    #[error("Peer reported chart '{0}' unknown")]
    Rejected(String),

    #[error("Pop-out of chart '{chart_id}' not acknowledged within {timeout_ms} ms")]
    Timeout { chart_id: String, timeout_ms: u64 },

    #[error("Sync connection lost while popping out chart '{0}'")]
    Disconnected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Peer connection closed")]
    Closed,

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Crate-level error wrapping every category
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiveFilterError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = LiveFilterError> = std::result::Result<T, E>;
