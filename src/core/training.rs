//! Training loop for an embedder under the cycle-consistency loss

use super::model_config::{AccuracyMetric, ExperimentConfig};
use super::similarity::scaled_similarity;
use crate::nn::{
    CycleConsistencyLoss, EmbedderGradients, LinearEmbedder, Optimizer, StackPair,
    StackPairDataset,
};
use crate::utils::timing::Timer;
use crate::{CycleAlignError, Result};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Held-out stack pairs scored after every epoch
const VALIDATION_PAIRS: usize = 8;

/// Training metrics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Training loss history
    pub train_loss: Vec<f64>,
    /// Validation loss history
    pub val_loss: Vec<f64>,
    /// Accuracy histories keyed by [`AccuracyMetric::name`]
    pub custom_metrics: HashMap<String, Vec<f64>>,
    /// Best validation loss
    pub best_val_loss: f64,
    /// Epoch with best validation loss
    pub best_epoch: usize,
    /// Total training time
    pub total_time: Duration,
}

impl TrainingMetrics {
    /// Create new metrics tracker
    pub fn new() -> Self {
        TrainingMetrics {
            train_loss: Vec::new(),
            val_loss: Vec::new(),
            custom_metrics: HashMap::new(),
            best_val_loss: f64::INFINITY,
            best_epoch: 0,
            total_time: Duration::from_secs(0),
        }
    }

    /// Update metrics for an epoch
    pub fn update_epoch(&mut self, epoch: usize, train_loss: f64, val_loss: f64) {
        self.train_loss.push(train_loss);
        self.val_loss.push(val_loss);

        if val_loss < self.best_val_loss {
            self.best_val_loss = val_loss;
            self.best_epoch = epoch;
        }
    }

    /// Add custom metric
    pub fn add_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Latest value of a custom metric
    pub fn last_metric(&self, name: &str) -> Option<f64> {
        self.custom_metrics.get(name).and_then(|v| v.last().copied())
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "Best validation loss: {:.4} at epoch {}\nTotal training time: {:.2}s\nFinal train loss: {:.4}\nFinal val loss: {:.4}",
            self.best_val_loss,
            self.best_epoch,
            self.total_time.as_secs_f32(),
            self.train_loss.last().unwrap_or(&0.0),
            self.val_loss.last().unwrap_or(&0.0)
        )
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (j, &v)| if v > best.1 { (j, v) } else { best })
        .0
}

/// Fraction of source rows whose hard nearest neighbour in `target` has the
/// source row itself as its hard nearest neighbour.
pub fn cycle_accuracy(
    source: ArrayView2<f64>,
    target: ArrayView2<f64>,
    loss: &CycleConsistencyLoss,
) -> Result<f64> {
    let config = loss.config();
    let forward = scaled_similarity(source, target, config.metric, config.temperature)?;
    let backward = scaled_similarity(target, source, config.metric, config.temperature)?;
    let hits = forward
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(i, row)| argmax(backward.row(argmax(row.view()))) == *i)
        .count();
    Ok(hits as f64 / source.nrows().max(1) as f64)
}

/// Fraction of rows whose soft-assignment argmax is the true counterpart
pub fn alignment_accuracy(assignment: ArrayView2<f64>, counterpart: &[usize]) -> Result<f64> {
    if assignment.nrows() != counterpart.len() {
        return Err(CycleAlignError::ShapeMismatch {
            context: "alignment accuracy",
            expected: assignment.nrows(),
            found: counterpart.len(),
        });
    }
    let hits = assignment
        .axis_iter(Axis(0))
        .zip(counterpart)
        .filter(|(row, &j)| argmax(row.view()) == j)
        .count();
    Ok(hits as f64 / counterpart.len().max(1) as f64)
}

/// Loss and embedder gradients of one stack pair
struct PairStep {
    loss: f64,
    grads: EmbedderGradients,
}

/// Trains a [`LinearEmbedder`] on synthetic stack pairs
pub struct Trainer {
    config: ExperimentConfig,
    loss: CycleConsistencyLoss,
    embedder: LinearEmbedder,
    optimizer: Optimizer,
}

impl Trainer {
    /// Build the embedder, loss and optimizer from a validated configuration
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let loss = CycleConsistencyLoss::new(config.loss)?;
        let embedder = LinearEmbedder::new(
            config.input_dim,
            config.embedding_dim,
            config.seed.unwrap_or(0),
        );
        let optimizer = Optimizer::new(config.optimizer.clone())?;
        Ok(Trainer {
            config,
            loss,
            embedder,
            optimizer,
        })
    }

    /// Current embedder
    pub fn embedder(&self) -> &LinearEmbedder {
        &self.embedder
    }

    /// Consume the trainer, returning the embedder
    pub fn into_embedder(self) -> LinearEmbedder {
        self.embedder
    }

    /// Loss and embedder gradients for one pair
    fn pair_step(&self, pair: &StackPair) -> Result<PairStep> {
        let a = self.embedder.forward(pair.first.view())?;
        let b = self.embedder.forward(pair.second.view())?;
        let g = if self.config.symmetric {
            self.loss.symmetric_forward_backward(a.view(), b.view())?
        } else {
            self.loss.forward_backward(a.view(), b.view())?
        };
        let mut grads = self.embedder.backward(pair.first.view(), g.grad_source.view())?;
        grads.accumulate(&self.embedder.backward(pair.second.view(), g.grad_target.view())?);
        Ok(PairStep { loss: g.loss, grads })
    }

    /// One optimizer step over a batch of pairs; returns the mean loss
    pub fn train_batch(&mut self, batch: &[StackPair]) -> Result<f64> {
        if batch.is_empty() {
            return Err(CycleAlignError::EmptyStack("training batch"));
        }
        let steps: Vec<PairStep> = batch
            .par_iter()
            .map(|pair| self.pair_step(pair))
            .collect::<Result<_>>()?;

        let mut grads = EmbedderGradients::zeros_like(&self.embedder);
        let mut total = 0.0;
        for step in &steps {
            grads.accumulate(&step.grads);
            total += step.loss;
        }
        let scale = 1.0 / batch.len() as f64;
        grads.scale(scale);

        debug!(
            step = self.optimizer.steps(),
            lr = self.optimizer.current_learning_rate(),
            grad_norm = grads.norm(),
            "optimizer step"
        );
        self.optimizer.step(&mut self.embedder, &grads);
        Ok(total * scale)
    }

    /// Mean loss and requested accuracies over `pairs`, without updating
    pub fn evaluate(&self, pairs: &[StackPair]) -> Result<(f64, HashMap<AccuracyMetric, f64>)> {
        if pairs.is_empty() {
            return Err(CycleAlignError::EmptyStack("evaluation set"));
        }
        let per_pair: Vec<(f64, Vec<(AccuracyMetric, f64)>)> = pairs
            .par_iter()
            .map(|pair| self.evaluate_pair(pair))
            .collect::<Result<_>>()?;

        let n = pairs.len() as f64;
        let mut accuracies = HashMap::new();
        let mut total = 0.0;
        for (loss, accs) in per_pair {
            total += loss;
            for (metric, value) in accs {
                *accuracies.entry(metric).or_insert(0.0) += value / n;
            }
        }
        Ok((total / n, accuracies))
    }

    fn evaluate_pair(&self, pair: &StackPair) -> Result<(f64, Vec<(AccuracyMetric, f64)>)> {
        let a = self.embedder.forward(pair.first.view())?;
        let b = self.embedder.forward(pair.second.view())?;
        let out = self.loss.forward(a.view(), b.view())?;
        let loss = if self.config.symmetric {
            out.loss + self.loss.loss(b.view(), a.view())?
        } else {
            out.loss
        };

        let accs = self
            .config
            .accuracy_metrics
            .iter()
            .map(|&metric| {
                let value = match metric {
                    AccuracyMetric::Cycle => cycle_accuracy(a.view(), b.view(), &self.loss)?,
                    AccuracyMetric::Alignment => {
                        alignment_accuracy(out.assignment.view(), &pair.counterpart)?
                    }
                };
                Ok((metric, value))
            })
            .collect::<Result<_>>()?;
        Ok((loss, accs))
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self, dataset: &mut StackPairDataset) -> Result<TrainingMetrics> {
        if dataset.stack_size() != self.config.stack_size
            || dataset.input_dim() != self.config.input_dim
        {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "dataset produces {}x{} stacks, config expects {}x{}",
                dataset.stack_size(),
                dataset.input_dim(),
                self.config.stack_size,
                self.config.input_dim
            )));
        }

        let _timer = Timer::new("fit");
        let validation = dataset.batch(VALIDATION_PAIRS);
        let mut metrics = TrainingMetrics::new();
        let start_time = Instant::now();
        info!(
            epochs = self.config.num_epochs,
            metric = %self.config.loss.metric,
            temperature = self.config.loss.temperature,
            "starting training"
        );

        for epoch in 0..self.config.num_epochs {
            let mut epoch_loss = 0.0;
            for _ in 0..self.config.batches_per_epoch {
                let batch = dataset.batch(self.config.batch_size);
                epoch_loss += self.train_batch(&batch)?;
            }
            let avg_train_loss = epoch_loss / self.config.batches_per_epoch as f64;

            let (val_loss, accuracies) = self.evaluate(&validation)?;
            metrics.update_epoch(epoch, avg_train_loss, val_loss);
            for metric in &self.config.accuracy_metrics {
                if let Some(value) = accuracies.get(metric) {
                    metrics.add_metric(metric.name(), *value);
                }
            }

            info!(
                epoch = epoch + 1,
                train_loss = avg_train_loss,
                val_loss,
                "epoch complete"
            );
        }

        metrics.total_time = start_time.elapsed();
        info!(best_epoch = metrics.best_epoch, best_val_loss = metrics.best_val_loss, "training complete");
        Ok(metrics)
    }
}
