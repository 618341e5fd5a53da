//! Synthetic stack pairs sharing a latent factor

use crate::{CycleAlignError, Result};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

/// Two stacks whose rows correspond through a shared latent value.
///
/// Row `i` of `first` and row `counterpart[i]` of `second` were generated
/// from the same latent vector.
#[derive(Clone, Debug)]
pub struct StackPair {
    /// First realization (stack_size × input_dim)
    pub first: Array2<f64>,
    /// Second realization, rows shuffled (stack_size × input_dim)
    pub second: Array2<f64>,
    /// Index into `second` of each row of `first`
    pub counterpart: Vec<usize>,
}

/// Generator of stack pairs: a latent factor seen through two nuisance
/// projections with additive Gaussian noise.
#[derive(Clone, Debug)]
pub struct StackPairDataset {
    stack_size: usize,
    latent_dim: usize,
    nuisance_dim: usize,
    latent_dist: Uniform<f64>,
    nuisance_dist: Normal<f64>,
    noise_dist: Normal<f64>,
    /// Shared latent-to-input map (latent_dim × input_dim)
    latent_map: Array2<f64>,
    /// Nuisance-to-input map (nuisance_dim × input_dim)
    nuisance_map: Array2<f64>,
    rng: StdRng,
}

impl StackPairDataset {
    /// Create a dataset emitting stacks of `stack_size` rows in `input_dim`
    /// dimensions.
    pub fn new(
        stack_size: usize,
        input_dim: usize,
        latent_dim: usize,
        nuisance_dim: usize,
        noise_std: f64,
        seed: u64,
    ) -> Result<Self> {
        if stack_size == 0 || input_dim == 0 || latent_dim == 0 {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "dataset dimensions must be positive (stack_size={stack_size}, input_dim={input_dim}, latent_dim={latent_dim})"
            )));
        }
        if !(noise_std >= 0.0 && noise_std.is_finite()) {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "noise_std must be non-negative and finite, got {noise_std}"
            )));
        }
        let noise_dist = Normal::new(0.0, noise_std).map_err(|e| {
            CycleAlignError::InvalidConfiguration(format!("noise_std {noise_std}: {e}"))
        })?;
        let nuisance_dist = Normal::new(0.0, 1.0).map_err(|e| {
            CycleAlignError::InvalidConfiguration(format!("nuisance distribution: {e}"))
        })?;

        let mut rng = StdRng::seed_from_u64(seed);
        let unit = Uniform::new(-1.0, 1.0);
        let latent_map = Array2::from_shape_fn((latent_dim, input_dim), |_| unit.sample(&mut rng));
        let nuisance_map =
            Array2::from_shape_fn((nuisance_dim, input_dim), |_| unit.sample(&mut rng));

        Ok(StackPairDataset {
            stack_size,
            latent_dim,
            nuisance_dim,
            latent_dist: unit,
            nuisance_dist,
            noise_dist,
            latent_map,
            nuisance_map,
            rng,
        })
    }

    /// Rows per stack
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Raw sample dimension
    pub fn input_dim(&self) -> usize {
        self.latent_map.ncols()
    }

    /// Draw one stack pair
    pub fn sample_pair(&mut self) -> StackPair {
        let latent = Array2::from_shape_fn((self.stack_size, self.latent_dim), |_| {
            self.latent_dist.sample(&mut self.rng)
        });
        let first = self.realize(&latent);
        let second = self.realize(&latent);

        // Hide the correspondence behind a row shuffle.
        let mut order: Vec<usize> = (0..self.stack_size).collect();
        order.shuffle(&mut self.rng);
        let second = second.select(Axis(0), &order);
        let mut counterpart = vec![0; self.stack_size];
        for (pos, &row) in order.iter().enumerate() {
            counterpart[row] = pos;
        }

        StackPair {
            first,
            second,
            counterpart,
        }
    }

    /// Draw `count` stack pairs
    pub fn batch(&mut self, count: usize) -> Vec<StackPair> {
        (0..count).map(|_| self.sample_pair()).collect()
    }

    fn realize(&mut self, latent: &Array2<f64>) -> Array2<f64> {
        // One nuisance value per stack, shared by every row.
        let nuisance = Array2::from_shape_fn((1, self.nuisance_dim), |_| {
            self.nuisance_dist.sample(&mut self.rng)
        });
        let shape = (self.stack_size, self.input_dim());
        let noise = Array2::from_shape_fn(shape, |_| self.noise_dist.sample(&mut self.rng));
        latent.dot(&self.latent_map) + nuisance.dot(&self.nuisance_map) + noise
    }
}
