//! Soft nearest-neighbour cycle-consistency loss
//!
//! For every row of the source stack, a softmax over scaled similarities
//! picks a soft nearest neighbour in the target stack. That neighbour is
//! then scored against the whole source stack and the loss asks it to land
//! back on the row it came from.

use crate::core::ops::{mean_cross_entropy_identity, softmax_rows, softmax_rows_backward};
use crate::core::{scaled_similarity, scaled_similarity_backward, LossConfig};
use crate::{CycleAlignError, Result};
use ndarray::{Array2, ArrayView2};
use tracing::trace;

/// Forward-pass result of [`CycleConsistencyLoss::forward`]
#[derive(Clone, Debug)]
pub struct CycleLossOutput {
    /// Mean cross-entropy over source rows
    pub loss: f64,
    /// Row-stochastic soft assignment of source rows to target rows (m×n)
    pub assignment: Array2<f64>,
    /// Soft nearest neighbours `assignment · target` (m×d)
    pub soft_neighbors: Array2<f64>,
    /// Scaled similarity of each soft neighbour to every source row (m×m)
    pub cycle_logits: Array2<f64>,
}

/// Loss together with gradients for both stacks
#[derive(Clone, Debug)]
pub struct CycleLossGradients {
    /// Loss value
    pub loss: f64,
    /// Gradient with respect to the source stack
    pub grad_source: Array2<f64>,
    /// Gradient with respect to the target stack
    pub grad_target: Array2<f64>,
}

/// Cycle-consistency loss between two embedding stacks
#[derive(Clone, Copy, Debug)]
pub struct CycleConsistencyLoss {
    config: LossConfig,
}

impl CycleConsistencyLoss {
    /// Create a loss from a configuration, validating it
    pub fn new(config: LossConfig) -> Result<Self> {
        config.validate()?;
        Ok(CycleConsistencyLoss { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Loss of `source` (m×d) cycling through `target` (n×d)
    pub fn loss(&self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<f64> {
        Ok(self.forward(source, target)?.loss)
    }

    /// `loss(a, b) + loss(b, a)`
    pub fn symmetric_loss(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<f64> {
        Ok(self.loss(a, b)? + self.loss(b, a)?)
    }

    /// Forward pass, keeping the intermediates
    pub fn forward(&self, source: ArrayView2<f64>, target: ArrayView2<f64>) -> Result<CycleLossOutput> {
        check_stacks(&source, &target)?;
        let LossConfig { metric, temperature } = self.config;

        let forward_logits = scaled_similarity(source, target, metric, temperature)?;
        let assignment = softmax_rows(forward_logits.view());
        let soft_neighbors = assignment.dot(&target);
        let cycle_logits = scaled_similarity(soft_neighbors.view(), source, metric, temperature)?;
        let (loss, _) = mean_cross_entropy_identity(cycle_logits.view())?;

        trace!(rows = source.nrows(), targets = target.nrows(), %metric, loss, "cycle loss forward");
        Ok(CycleLossOutput {
            loss,
            assignment,
            soft_neighbors,
            cycle_logits,
        })
    }

    /// Forward and backward pass
    pub fn forward_backward(
        &self,
        source: ArrayView2<f64>,
        target: ArrayView2<f64>,
    ) -> Result<CycleLossGradients> {
        let out = self.forward(source, target)?;
        let LossConfig { metric, temperature } = self.config;

        let (loss, grad_cycle_logits) = mean_cross_entropy_identity(out.cycle_logits.view())?;

        // cycle_logits = sim(soft_neighbors, source)
        let (grad_neighbors, mut grad_source) = scaled_similarity_backward(
            out.soft_neighbors.view(),
            source,
            metric,
            temperature,
            grad_cycle_logits.view(),
        )?;

        // soft_neighbors = assignment · target
        let grad_assignment = grad_neighbors.dot(&target.t());
        let mut grad_target = out.assignment.t().dot(&grad_neighbors);

        // assignment = softmax(sim(source, target))
        let grad_forward_logits =
            softmax_rows_backward(out.assignment.view(), grad_assignment.view());
        let (gs, gt) = scaled_similarity_backward(
            source,
            target,
            metric,
            temperature,
            grad_forward_logits.view(),
        )?;
        grad_source += &gs;
        grad_target += &gt;

        Ok(CycleLossGradients {
            loss,
            grad_source,
            grad_target,
        })
    }

    /// Both directions summed, gradients included.
    ///
    /// `grad_source` is the gradient with respect to `a`, `grad_target` with
    /// respect to `b`.
    pub fn symmetric_forward_backward(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
    ) -> Result<CycleLossGradients> {
        let ab = self.forward_backward(a, b)?;
        let ba = self.forward_backward(b, a)?;
        Ok(CycleLossGradients {
            loss: ab.loss + ba.loss,
            grad_source: ab.grad_source + &ba.grad_target,
            grad_target: ab.grad_target + &ba.grad_source,
        })
    }
}

fn check_stacks(source: &ArrayView2<f64>, target: &ArrayView2<f64>) -> Result<()> {
    if source.nrows() == 0 {
        return Err(CycleAlignError::EmptyStack("source"));
    }
    if target.nrows() == 0 {
        return Err(CycleAlignError::EmptyStack("target"));
    }
    if source.ncols() != target.ncols() {
        return Err(CycleAlignError::ShapeMismatch {
            context: "cycle consistency loss",
            expected: source.ncols(),
            found: target.ncols(),
        });
    }
    Ok(())
}
