//! # cycle-align: soft correspondence between embedding stacks
//!
//! This library computes the soft nearest-neighbour cycle-consistency loss
//! used to align two stacks of embeddings that share a latent factor but
//! differ in a nuisance factor, together with an explicit backward pass so a
//! caller can train the embedding producer without an autodiff framework.
//!
//! ## Features
//!
//! - **Metrics**: squared-Euclidean, Euclidean, Manhattan, Chebyshev and cosine
//! - **Cycle loss**: forward and backward passes, asymmetric and symmetric
//! - **Training harness**: linear embedder, SGD/Adam, synthetic stack pairs
//! - **Perturbed optimizers**: Fenchel-Young loss over a grid shortest path

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Metrics, similarity kernels, configuration and training loop
pub mod core;

/// Losses, embedders, optimizers and datasets
pub mod nn;

/// Utility functions and helpers
pub mod utils;

// Re-export commonly used types
pub use core::{ExperimentConfig, LossConfig, Metric};
pub use nn::{CycleConsistencyLoss, CycleLossGradients, CycleLossOutput};

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum CycleAlignError {
    /// Unknown metric, non-positive temperature, malformed schedule, ...
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operand shapes do not line up
    #[error("Shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Operation that rejected the input
        context: &'static str,
        /// Expected extent
        expected: usize,
        /// Extent actually supplied
        found: usize,
    },

    /// A stack with no rows was supplied
    #[error("Empty stack: {0}")]
    EmptyStack(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, CycleAlignError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        core::{
            pairwise, scaled_similarity, AccuracyMetric, ExperimentConfig, LossConfig, Metric,
            Trainer, TrainingMetrics,
        },
        nn::{CycleConsistencyLoss, LinearEmbedder, Optimizer, StackPairDataset},
        CycleAlignError, Result,
    };
}
