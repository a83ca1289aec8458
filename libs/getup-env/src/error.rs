//! Error types for environment setup and stepping.

use thiserror::Error;

/// Errors raised while building or stepping the environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Control mode string is not one of `P`, `V` or `T`.
    #[error("unknown controller type: {0}")]
    UnknownControlMode(String),

    /// Only Gaussian-tolerance reward shaping is implemented.
    #[error("non-gaussian reward shaping is not supported")]
    UnsupportedRewardMode,

    /// A configured scale names a term with no implementation.
    #[error("unknown reward term: {0}")]
    UnknownRewardTerm(String),

    /// A constraint term's prefix is not one of the declared reward groups.
    #[error("reward term {term} belongs to undeclared group {group}")]
    UnknownRewardGroup {
        /// Full term name.
        term: String,
        /// Prefix extracted from the term name.
        group: String,
    },

    /// A configured joint name is not present in the asset.
    #[error("joint {0} not found in asset")]
    MissingJoint(String),

    /// A required body pattern matched no body in the asset.
    #[error("no body matches pattern {0}")]
    MissingBody(String),

    /// A sampling interval with `low > high` or non-finite bounds.
    #[error("invalid range for {channel}: [{low}, {high}]")]
    InvalidRange {
        channel: &'static str,
        low: f32,
        high: f32,
    },

    /// Any other out-of-bounds configuration value.
    #[error("invalid config value {field}: {message}")]
    InvalidConfig {
        field: &'static str,
        message: String,
    },

    /// Batch dimensions disagree between caller, config and physics.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnvError>;
