//! Metrics, similarity kernels, configuration and the training loop

mod metric;
mod model_config;
pub mod ops;
mod similarity;
mod training;

pub use metric::Metric;
pub use model_config::{
    AccuracyMetric, ExperimentConfig, LossConfig, OptimizerConfig, OptimizerKind,
    PiecewiseSchedule,
};
pub use similarity::{
    check_temperature, pairwise, scaled_similarity, scaled_similarity_backward,
    COSINE_NORM_EPSILON, EUCLIDEAN_EPSILON,
};
pub use training::{alignment_accuracy, cycle_accuracy, Trainer, TrainingMetrics};
