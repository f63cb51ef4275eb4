//! Error types for top-k KL computation.

use thiserror::Error;

/// Errors that can occur while computing top-k KL/TV statistics.
///
/// Numerical degeneracy (near-zero or over-full probability mass) is never an
/// error: it is clamped inside the kernel. These variants cover malformed
/// inputs and the surrounding configuration layer.
#[derive(Debug, Error)]
pub enum TopKKlError {
    /// Array shapes disagree.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which input or relation failed.
        what: &'static str,
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// Top-k width is zero or larger than the vocabulary.
    #[error("Invalid top-k: k = {k}, vocab size = {vocab_size}")]
    InvalidTopK {
        /// Requested or observed k.
        k: i32,
        /// Vocabulary size of the logits.
        vocab_size: i32,
    },

    /// A rollout token id does not index into the vocabulary.
    #[error("Token id {id} out of range for vocab size {vocab_size}")]
    TokenIdOutOfRange {
        /// Offending token id.
        id: i32,
        /// Vocabulary size of the logits.
        vocab_size: i32,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// Host read of an evaluated array failed.
    #[error("Array read error: {0}")]
    Read(#[from] mlx_rs::error::AsSliceError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for top-k KL operations.
pub type Result<T> = std::result::Result<T, TopKKlError>;
