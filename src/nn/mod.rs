//! Losses, the embedding producer, optimizers and datasets

mod cycle_loss;
mod datasets;
mod embedder;
mod optimizer;
mod perturbed;

pub use cycle_loss::{CycleConsistencyLoss, CycleLossGradients, CycleLossOutput};
pub use datasets::{StackPair, StackPairDataset};
pub use embedder::{EmbedderGradients, LinearEmbedder};
pub use optimizer::Optimizer;
pub use perturbed::{grid_shortest_path, PerturbedConfig, PerturbedShortestPath, COST_FLOOR};
