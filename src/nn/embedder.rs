//! Linear embedding producer
//!
//! Maps raw sample rows to embedding rows, `Y = X W + b`. Stands in for the
//! embedding network that the cycle loss trains.

use crate::{CycleAlignError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Trainable affine map from `input_dim` to `output_dim`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearEmbedder {
    /// Weight matrix (input_dim × output_dim)
    pub weight: Array2<f64>,
    /// Bias (output_dim)
    pub bias: Array1<f64>,
}

/// Parameter gradients of [`LinearEmbedder`]
#[derive(Clone, Debug)]
pub struct EmbedderGradients {
    /// Gradient with respect to the weight
    pub weight: Array2<f64>,
    /// Gradient with respect to the bias
    pub bias: Array1<f64>,
}

impl EmbedderGradients {
    /// Zero gradients shaped like `embedder`
    pub fn zeros_like(embedder: &LinearEmbedder) -> Self {
        EmbedderGradients {
            weight: Array2::zeros(embedder.weight.raw_dim()),
            bias: Array1::zeros(embedder.bias.len()),
        }
    }

    /// Accumulate another gradient in place
    pub fn accumulate(&mut self, other: &EmbedderGradients) {
        self.weight += &other.weight;
        self.bias += &other.bias;
    }

    /// Multiply every entry by `factor`
    pub fn scale(&mut self, factor: f64) {
        self.weight *= factor;
        self.bias *= factor;
    }

    /// Global L2 norm
    pub fn norm(&self) -> f64 {
        (self.weight.mapv(|x| x * x).sum() + self.bias.mapv(|x| x * x).sum()).sqrt()
    }
}

impl LinearEmbedder {
    /// Glorot-uniform weights, zero bias
    pub fn new(input_dim: usize, output_dim: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let limit = (6.0 / (input_dim + output_dim).max(1) as f64).sqrt();
        let weight = Array2::from_shape_fn((input_dim, output_dim), |_| rng.gen_range(-limit..limit));

        LinearEmbedder {
            weight,
            bias: Array1::zeros(output_dim),
        }
    }

    /// Input dimension
    pub fn input_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Embedding dimension
    pub fn output_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Embed a stack of samples (m×input_dim → m×output_dim)
    pub fn forward(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_input(&x)?;
        Ok(x.dot(&self.weight) + &self.bias)
    }

    /// Parameter gradients given the upstream gradient of the embeddings
    pub fn backward(&self, x: ArrayView2<f64>, grad_out: ArrayView2<f64>) -> Result<EmbedderGradients> {
        self.check_input(&x)?;
        if grad_out.dim() != (x.nrows(), self.output_dim()) {
            return Err(CycleAlignError::ShapeMismatch {
                context: "embedder backward",
                expected: x.nrows() * self.output_dim(),
                found: grad_out.len(),
            });
        }
        Ok(EmbedderGradients {
            weight: x.t().dot(&grad_out),
            bias: grad_out.sum_axis(Axis(0)),
        })
    }

    fn check_input(&self, x: &ArrayView2<f64>) -> Result<()> {
        if x.ncols() != self.input_dim() {
            return Err(CycleAlignError::ShapeMismatch {
                context: "embedder input",
                expected: self.input_dim(),
                found: x.ncols(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_forward_shape_and_bias() {
        let mut embedder = LinearEmbedder::new(3, 2, 0);
        embedder.bias = array![1.0, -1.0];
        let x = Array2::zeros((4, 3));
        let y = embedder.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (4, 2));
        assert_eq!(y.row(3), array![1.0, -1.0]);
        assert!(embedder.forward(Array2::zeros((4, 2)).view()).is_err());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let embedder = LinearEmbedder::new(3, 2, 5);
        let x = array![[0.5, -1.0, 2.0], [1.5, 0.0, -0.5]];
        let upstream = array![[1.0, 2.0], [-0.5, 0.25]];
        let grads = embedder.backward(x.view(), upstream.view()).unwrap();

        let numeric = crate::utils::numerical_gradient(
            &embedder.weight,
            |w| {
                let probe = LinearEmbedder {
                    weight: w.clone(),
                    bias: embedder.bias.clone(),
                };
                (&probe.forward(x.view()).unwrap() * &upstream).sum()
            },
            1e-6,
        );
        for (a, n) in grads.weight.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(a, n, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(grads.bias[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(grads.bias[1], 2.25, epsilon = 1e-12);
    }
}
