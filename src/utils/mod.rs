//! Utility functions for cycle-align

use crate::Result;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Save object to JSON file
pub fn save_json<T: Serialize>(obj: &T, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(obj)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Load object from JSON file
pub fn load_json<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let obj = serde_json::from_str(&contents)?;
    Ok(obj)
}

/// Matrix with entries uniform in `[-1, 1)`, reproducible from `seed`
pub fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

/// Central finite-difference gradient of a scalar function of a matrix.
///
/// Used to check analytic backward passes.
pub fn numerical_gradient<F>(x: &Array2<f64>, f: F, step: f64) -> Array2<f64>
where
    F: Fn(&Array2<f64>) -> f64,
{
    let mut probe = x.clone();
    let mut grad = Array2::zeros(x.raw_dim());
    for idx in ndarray::indices(x.raw_dim()) {
        let orig = probe[idx];
        probe[idx] = orig + step;
        let plus = f(&probe);
        probe[idx] = orig - step;
        let minus = f(&probe);
        probe[idx] = orig;
        grad[idx] = (plus - minus) / (2.0 * step);
    }
    grad
}

/// Timing utilities
pub mod timing {
    use std::time::Instant;

    /// Timer that reports its elapsed time through `tracing` when dropped
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start new timer
        pub fn new(name: &str) -> Self {
            Timer {
                start: Instant::now(),
                name: name.to_string(),
            }
        }

        /// Elapsed seconds
        pub fn elapsed(&self) -> f64 {
            self.start.elapsed().as_secs_f64()
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            tracing::debug!(timer = %self.name, seconds = self.elapsed(), "timer finished");
        }
    }
}
