//! Error kinds for the inference engine, per the recoverability table in the design docs.

use crate::graph::NodeId;
use thiserror::Error;

/// Top level error type returned by fallible graph and sampler operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// API misuse: access before build, pop after build, double init, and so on.
    /// Indicates a caller bug; never raised from valid sequences of calls.
    #[error("logic error: {0}")]
    Logic(String),

    /// Shape or rank mismatch detected while constructing the graph.
    #[error("dimension error: {0}")]
    Dimension(String),

    /// A distribution or function parameter check failed, or a bound was
    /// attached to a distribution that does not support bounding.
    #[error("distribution error: {0}")]
    Distribution(String),

    /// A numerical failure during sampling: non-positive-definite precision,
    /// a NaN weight, or a degenerate backward-smoother normaliser. Fatal to
    /// the current run, but already-written monitor records remain valid.
    #[error("numeric error at node {node}: {message}")]
    Numeric { node: NodeId, message: String },

    /// A value violated a domain constraint: a non-integer value assigned to
    /// a discrete node, or a missing value in an observed buffer.
    #[error("domain error: {0}")]
    Domain(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn numeric(node: NodeId, message: impl Into<String>) -> Self {
        EngineError::Numeric {
            node,
            message: message.into(),
        }
    }
}
