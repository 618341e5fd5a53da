//! Perturbed shortest-path solver and its Fenchel-Young loss
//!
//! A grid shortest-path solver is piecewise constant in its costs. Averaging
//! it over Gaussian perturbations of the costs gives a smooth surrogate whose
//! Fenchel-Young loss has the simple gradient `y_true - E[y*]` (minimize) or
//! `E[y*] - y_true` (maximize).
//!
//! The solver needs positive cell costs. A perturbed sample whose costs
//! (`theta`, or `-theta` when maximizing) fall below [`COST_FLOOR`] is shifted
//! by one constant so its cheapest cell costs exactly the floor. Rewards thus
//! become regrets against the best perturbed cell. The loss is scored on the
//! shifted costs the solver saw, and the gradient carries the shift's
//! dependence on that cheapest cell.

use crate::{CycleAlignError, Result};
use ndarray::{Array2, ArrayView2};
use petgraph::graph::{DiGraph, NodeIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cheapest cost a perturbed sample may hand to the solver
pub const COST_FLOOR: f64 = 1e-6;

/// 8-connected grid moves
const NEIGHBORS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Cheapest top-left to bottom-right path on an 8-connected grid.
///
/// The cost of a path is the sum of the costs of every cell it visits,
/// endpoints included. Returns a 0/1 indicator of the visited cells.
pub fn grid_shortest_path(costs: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = costs.dim();
    if rows == 0 || cols == 0 {
        return Err(CycleAlignError::InvalidConfiguration(
            "shortest path needs a non-empty grid".to_string(),
        ));
    }
    if let Some(bad) = costs.iter().find(|c| !(**c > 0.0 && c.is_finite())) {
        return Err(CycleAlignError::InvalidConfiguration(format!(
            "grid costs must be positive and finite, got {bad}"
        )));
    }

    let mut graph = DiGraph::<(usize, usize), f64>::with_capacity(rows * cols, rows * cols * 8);
    let nodes: Vec<NodeIndex> = (0..rows * cols)
        .map(|k| graph.add_node((k / cols, k % cols)))
        .collect();
    for r in 0..rows {
        for c in 0..cols {
            for (dr, dc) in NEIGHBORS {
                let (nr, nc) = (r as isize + dr, c as isize + dc);
                if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                    continue;
                }
                let (nr, nc) = (nr as usize, nc as usize);
                // Entering a cell pays its cost.
                graph.add_edge(nodes[r * cols + c], nodes[nr * cols + nc], costs[[nr, nc]]);
            }
        }
    }

    let start = nodes[0];
    let goal = nodes[rows * cols - 1];
    let (_, path) = petgraph::algo::astar(&graph, start, |n| n == goal, |e| *e.weight(), |_| 0.0)
        .ok_or_else(|| {
            CycleAlignError::InvalidConfiguration("grid has no path to the goal".to_string())
        })?;

    let mut indicator = Array2::zeros((rows, cols));
    for node in path {
        indicator[graph[node]] = 1.0;
    }
    Ok(indicator)
}

/// Perturbation settings
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerturbedConfig {
    /// Monte-Carlo samples per evaluation
    pub num_samples: usize,
    /// Standard deviation of the Gaussian perturbation
    pub sigma: f64,
    /// `true`: `theta` are costs to minimize; `false`: rewards to maximize
    pub minimize: bool,
    /// Base seed; sample `s` uses `seed + s`
    pub seed: u64,
}

impl Default for PerturbedConfig {
    fn default() -> Self {
        PerturbedConfig {
            num_samples: 8,
            sigma: 0.5,
            minimize: true,
            seed: 0,
        }
    }
}

impl PerturbedConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(CycleAlignError::InvalidConfiguration(
                "num_samples must be positive".to_string(),
            ));
        }
        if !(self.sigma >= 0.0 && self.sigma.is_finite()) {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "sigma must be non-negative and finite, got {}",
                self.sigma
            )));
        }
        Ok(())
    }
}

/// One perturbed solve
struct PerturbedSample {
    /// Costs handed to the solver, shift included
    costs: Array2<f64>,
    solution: Array2<f64>,
    /// Cell that fixed the shift, when the costs were shifted
    shift_cell: Option<(usize, usize)>,
}

/// Grid shortest path smoothed by Gaussian perturbation
#[derive(Clone, Copy, Debug)]
pub struct PerturbedShortestPath {
    config: PerturbedConfig,
}

impl PerturbedShortestPath {
    /// Create from a validated configuration
    pub fn new(config: PerturbedConfig) -> Result<Self> {
        config.validate()?;
        Ok(PerturbedShortestPath { config })
    }

    /// Monte-Carlo estimate of `E[y*(theta + sigma Z)]`
    pub fn expected_path(&self, theta: ArrayView2<f64>) -> Result<Array2<f64>> {
        let samples = self.samples(theta)?;
        Ok(mean_solution(&samples, theta.raw_dim()))
    }

    /// Fenchel-Young loss against a target path indicator, with its gradient
    /// with respect to `theta`.
    ///
    /// Each sample contributes `<c, y_true> - <c, y*>` on the costs `c` it was
    /// solved with, so the loss is non-negative whenever `y_true` is a path.
    pub fn fenchel_young_loss(
        &self,
        theta: ArrayView2<f64>,
        y_true: ArrayView2<f64>,
    ) -> Result<(f64, Array2<f64>)> {
        if theta.dim() != y_true.dim() {
            return Err(CycleAlignError::ShapeMismatch {
                context: "fenchel-young loss",
                expected: theta.len(),
                found: y_true.len(),
            });
        }
        let samples = self.samples(theta)?;
        let sign = self.sign();

        let mut loss = 0.0;
        let mut grad = Array2::zeros(theta.raw_dim());
        for s in &samples {
            let diff = &y_true - &s.solution;
            loss += (&s.costs * &diff).sum();
            grad.scaled_add(sign, &diff);
            // shift = FLOOR - sign * perturbed[cell], paid on every visited cell
            if let Some(cell) = s.shift_cell {
                grad[cell] -= sign * diff.sum();
            }
        }
        let n = samples.len() as f64;
        let loss = loss / n;
        grad.mapv_inplace(|g| g / n);

        debug!(loss, samples = samples.len(), "fenchel-young loss");
        Ok((loss, grad))
    }

    fn sign(&self) -> f64 {
        if self.config.minimize {
            1.0
        } else {
            -1.0
        }
    }

    fn samples(&self, theta: ArrayView2<f64>) -> Result<Vec<PerturbedSample>> {
        let PerturbedConfig {
            num_samples,
            sigma,
            seed,
            ..
        } = self.config;
        let sign = self.sign();

        (0..num_samples)
            .into_par_iter()
            .map(|s| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(s as u64));
                let mut costs = theta.mapv(|t| {
                    let z: f64 = StandardNormal.sample(&mut rng);
                    sign * (t + sigma * z)
                });
                let (cell, lowest) = cheapest_cell(costs.view());
                let shift_cell = if lowest < COST_FLOOR {
                    costs += COST_FLOOR - lowest;
                    Some(cell)
                } else {
                    None
                };
                let solution = grid_shortest_path(costs.view())?;
                Ok(PerturbedSample {
                    costs,
                    solution,
                    shift_cell,
                })
            })
            .collect()
    }
}

/// Index and value of the smallest cost. NaN never wins; the solver rejects it.
fn cheapest_cell(costs: ArrayView2<f64>) -> ((usize, usize), f64) {
    costs
        .indexed_iter()
        .fold(((0, 0), f64::INFINITY), |best, (ij, &c)| {
            if c < best.1 {
                (ij, c)
            } else {
                best
            }
        })
}

fn mean_solution(samples: &[PerturbedSample], dim: ndarray::Ix2) -> Array2<f64> {
    let mut mean = Array2::zeros(dim);
    for s in samples {
        mean += &s.solution;
    }
    mean / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Axis};

    fn cheap_diagonal() -> Array2<f64> {
        array![[1.0, 9.0, 9.0], [9.0, 1.0, 9.0], [9.0, 9.0, 1.0]]
    }

    #[test]
    fn test_shortest_path_follows_cheap_cells() {
        let path = grid_shortest_path(cheap_diagonal().view()).unwrap();
        assert_eq!(path, Array2::<f64>::eye(3));
    }

    #[test]
    fn test_single_cell_grid() {
        let path = grid_shortest_path(array![[2.0]].view()).unwrap();
        assert_eq!(path, array![[1.0]]);
    }

    #[test]
    fn test_rejects_invalid_costs() {
        assert!(grid_shortest_path(array![[1.0, -1.0]].view()).is_err());
        assert!(grid_shortest_path(Array2::<f64>::zeros((0, 3)).view()).is_err());
        assert!(PerturbedShortestPath::new(PerturbedConfig {
            num_samples: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_zero_sigma_recovers_solver() {
        let solver = PerturbedShortestPath::new(PerturbedConfig {
            sigma: 0.0,
            ..Default::default()
        })
        .unwrap();
        let expected = solver.expected_path(cheap_diagonal().view()).unwrap();
        assert_eq!(expected, Array2::<f64>::eye(3));

        let (loss, grad) = solver
            .fenchel_young_loss(cheap_diagonal().view(), Array2::<f64>::eye(3).view())
            .unwrap();
        assert_abs_diff_eq!(loss, 0.0, epsilon = 1e-12);
        assert!(grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_expected_path_is_a_fractional_path() {
        let solver = PerturbedShortestPath::new(PerturbedConfig {
            num_samples: 16,
            sigma: 2.0,
            minimize: true,
            seed: 3,
        })
        .unwrap();
        let theta = Array2::from_elem((4, 4), 3.0);
        let y = solver.expected_path(theta.view()).unwrap();
        assert!(y.iter().all(|v| (0.0..=1.0).contains(v)));
        // Endpoints are on every path.
        assert_eq!(y[[0, 0]], 1.0);
        assert_eq!(y[[3, 3]], 1.0);
        assert!(y.sum_axis(Axis(0)).iter().all(|&c| c >= 1.0 - 1e-12));
    }

    #[test]
    fn test_loss_is_nonnegative_for_wrong_target() {
        let solver = PerturbedShortestPath::new(PerturbedConfig {
            num_samples: 4,
            sigma: 0.1,
            minimize: true,
            seed: 1,
        })
        .unwrap();
        // Target walks the expensive border.
        let target = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        let (loss, grad) = solver
            .fenchel_young_loss(cheap_diagonal().view(), target.view())
            .unwrap();
        assert!(loss > 0.0);
        // A descent step makes the target's cells cheaper and the diagonal dearer.
        assert!(grad[[1, 1]] < 0.0);
        assert!(grad[[0, 1]] > 0.0);
    }

    #[test]
    fn test_maximize_mirrors_minimize() {
        let solver = PerturbedShortestPath::new(PerturbedConfig {
            sigma: 0.0,
            minimize: false,
            ..Default::default()
        })
        .unwrap();
        let rewards = -cheap_diagonal();
        let y = solver.expected_path(rewards.view()).unwrap();
        assert_eq!(y, Array2::<f64>::eye(3));
    }

    fn border_rewards() -> Array2<f64> {
        array![[5.0, 5.0, 5.0], [0.1, 0.1, 5.0], [0.1, 0.1, 5.0]]
    }

    fn maximizer() -> PerturbedShortestPath {
        PerturbedShortestPath::new(PerturbedConfig {
            num_samples: 8,
            sigma: 0.1,
            minimize: false,
            seed: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_maximize_follows_high_reward_cells() {
        let solver = maximizer();

        let y = solver.expected_path(border_rewards().view()).unwrap();
        for cell in [(1, 0), (1, 1), (2, 0), (2, 1)] {
            assert_eq!(y[cell], 0.0);
        }
        assert_eq!(y[[0, 1]], 1.0);
        assert_eq!(y[[1, 2]], 1.0);

        let diagonal_rewards = array![[5.0, 0.1, 0.1], [0.1, 5.0, 0.1], [0.1, 0.1, 5.0]];
        let y = solver.expected_path(diagonal_rewards.view()).unwrap();
        assert_eq!(y, Array2::<f64>::eye(3));
    }

    #[test]
    fn test_maximize_loss_is_nonnegative() {
        let solver = maximizer();
        let border = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        let (loss, _) = solver
            .fenchel_young_loss(border_rewards().view(), border.view())
            .unwrap();
        assert!(loss >= 0.0);
        assert!(loss < 1.0);

        let (loss, grad) = solver
            .fenchel_young_loss(border_rewards().view(), Array2::<f64>::eye(3).view())
            .unwrap();
        assert!(loss > 1.0);
        // A descent step raises the reward of the skipped centre cell.
        assert!(grad[[1, 1]] < 0.0);
    }

    #[test]
    fn test_shifted_costs_gradient_against_finite_difference() {
        let solver = PerturbedShortestPath::new(PerturbedConfig {
            num_samples: 1,
            sigma: 0.0,
            minimize: true,
            seed: 0,
        })
        .unwrap();
        // The negative goal cell forces a shift of every cost.
        let theta = array![[1.0, 9.0, 9.0], [9.0, 1.0, 9.0], [9.0, 9.0, -0.5]];
        let target = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];

        let (loss, grad) = solver
            .fenchel_young_loss(theta.view(), target.view())
            .unwrap();
        assert_abs_diff_eq!(loss, 27.0, epsilon = 1e-5);

        let numeric = crate::utils::numerical_gradient(
            &theta,
            |t| solver.fenchel_young_loss(t.view(), target.view()).unwrap().0,
            1e-4,
        );
        for (a, n) in grad.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(a, n, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(grad[[2, 2]], -2.0, epsilon = 1e-12);
    }
}
