//! First-order optimizers for [`LinearEmbedder`]

use super::embedder::{EmbedderGradients, LinearEmbedder};
use crate::core::{OptimizerConfig, OptimizerKind};
use crate::Result;
use ndarray::{Array1, Array2};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

/// Adam first and second moment estimates
#[derive(Clone, Debug)]
struct AdamState {
    m_weight: Array2<f64>,
    v_weight: Array2<f64>,
    m_bias: Array1<f64>,
    v_bias: Array1<f64>,
}

/// Optimizer with a learning-rate schedule and a step counter
#[derive(Clone, Debug)]
pub struct Optimizer {
    config: OptimizerConfig,
    step: usize,
    adam: Option<AdamState>,
}

impl Optimizer {
    /// Create an optimizer from a validated configuration
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Optimizer {
            config,
            step: 0,
            adam: None,
        })
    }

    /// Number of steps taken so far
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Learning rate the next step will use
    pub fn current_learning_rate(&self) -> f64 {
        self.config.learning_rate_at(self.step)
    }

    /// Apply one descent step to `params`
    pub fn step(&mut self, params: &mut LinearEmbedder, grads: &EmbedderGradients) {
        let lr = self.current_learning_rate();
        match self.config.kind {
            OptimizerKind::Sgd => {
                params.weight.scaled_add(-lr, &grads.weight);
                params.bias.scaled_add(-lr, &grads.bias);
            }
            OptimizerKind::Adam => {
                let state = self.adam.get_or_insert_with(|| AdamState {
                    m_weight: Array2::zeros(params.weight.raw_dim()),
                    v_weight: Array2::zeros(params.weight.raw_dim()),
                    m_bias: Array1::zeros(params.bias.len()),
                    v_bias: Array1::zeros(params.bias.len()),
                });
                let t = (self.step + 1) as i32;
                let c1 = 1.0 - ADAM_BETA1.powi(t);
                let c2 = 1.0 - ADAM_BETA2.powi(t);

                adam_update(&mut params.weight, &grads.weight, &mut state.m_weight, &mut state.v_weight, lr, c1, c2);
                adam_update(&mut params.bias, &grads.bias, &mut state.m_bias, &mut state.v_bias, lr, c1, c2);
            }
        }
        self.step += 1;
    }
}

fn adam_update<D: ndarray::Dimension>(
    param: &mut ndarray::Array<f64, D>,
    grad: &ndarray::Array<f64, D>,
    m: &mut ndarray::Array<f64, D>,
    v: &mut ndarray::Array<f64, D>,
    lr: f64,
    bias_correction1: f64,
    bias_correction2: f64,
) {
    ndarray::Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
        });
}
