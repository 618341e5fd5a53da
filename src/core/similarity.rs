//! Pairwise distance and temperature-scaled similarity, with gradients

use super::metric::Metric;
use crate::{CycleAlignError, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Added under the square root of the Euclidean metric so its gradient
/// stays finite at zero distance.
pub const EUCLIDEAN_EPSILON: f64 = 1e-8;

/// Lower bound on row norms before cosine normalization. Zero rows map to
/// the zero vector instead of NaN.
pub const COSINE_NORM_EPSILON: f64 = 1e-12;

/// Reject a non-positive or non-finite temperature
pub fn check_temperature(temperature: f64) -> Result<()> {
    if temperature > 0.0 && temperature.is_finite() {
        Ok(())
    } else {
        Err(CycleAlignError::InvalidConfiguration(format!(
            "temperature must be positive and finite, got {temperature}"
        )))
    }
}

fn check_operands(a: &ArrayView2<f64>, b: &ArrayView2<f64>, context: &'static str) -> Result<()> {
    if a.ncols() != b.ncols() {
        return Err(CycleAlignError::ShapeMismatch {
            context,
            expected: a.ncols(),
            found: b.ncols(),
        });
    }
    Ok(())
}

/// Pairwise comparison of every row of `a` (m×d) with every row of `b` (n×d).
///
/// Returns an m×n matrix of distances, or similarities for [`Metric::Cosine`].
pub fn pairwise(a: ArrayView2<f64>, b: ArrayView2<f64>, metric: Metric) -> Result<Array2<f64>> {
    check_operands(&a, &b, "pairwise")?;
    Ok(match metric {
        Metric::SquaredEuclidean => squared_euclidean(a, b),
        Metric::Euclidean => squared_euclidean(a, b).mapv(|d| (d + EUCLIDEAN_EPSILON).sqrt()),
        Metric::Manhattan => elementwise_reduce(a, b, |acc, diff| acc + diff.abs()),
        Metric::Chebyshev => elementwise_reduce(a, b, |acc, diff| {
            let d = diff.abs();
            if d > acc || d.is_nan() {
                d
            } else {
                acc
            }
        }),
        Metric::Cosine => {
            let (a_hat, _) = normalize_rows(a);
            let (b_hat, _) = normalize_rows(b);
            a_hat.dot(&b_hat.t())
        }
    })
}

/// Similarity scaled by temperature: `-distance / t`, or `cosine / t`.
pub fn scaled_similarity(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    metric: Metric,
    temperature: f64,
) -> Result<Array2<f64>> {
    check_temperature(temperature)?;
    let raw = pairwise(a, b, metric)?;
    let sign = if metric.is_distance() { -1.0 } else { 1.0 };
    Ok(raw * (sign / temperature))
}

/// Backward pass of [`scaled_similarity`].
///
/// `grad_sim` is the upstream gradient with respect to the m×n scaled
/// similarity. Returns the gradients with respect to `a` and `b`.
pub fn scaled_similarity_backward(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    metric: Metric,
    temperature: f64,
    grad_sim: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>)> {
    check_temperature(temperature)?;
    check_operands(&a, &b, "scaled_similarity_backward")?;
    if grad_sim.dim() != (a.nrows(), b.nrows()) {
        return Err(CycleAlignError::ShapeMismatch {
            context: "scaled_similarity_backward",
            expected: a.nrows() * b.nrows(),
            found: grad_sim.len(),
        });
    }

    let sign = if metric.is_distance() { -1.0 } else { 1.0 };
    let grad_raw = &grad_sim * (sign / temperature);

    Ok(match metric {
        Metric::SquaredEuclidean => {
            let sq = squared_euclidean(a, b);
            // Clamped entries are constant.
            let g = ndarray::Zip::from(&grad_raw)
                .and(&sq)
                .map_collect(|&g, &d| if d > 0.0 { g } else { 0.0 });
            squared_euclidean_backward(a, b, g.view())
        }
        Metric::Euclidean => {
            let sq = squared_euclidean(a, b);
            let g = ndarray::Zip::from(&grad_raw).and(&sq).map_collect(|&g, &d| {
                if d > 0.0 {
                    g / (2.0 * (d + EUCLIDEAN_EPSILON).sqrt())
                } else {
                    0.0
                }
            });
            squared_euclidean_backward(a, b, g.view())
        }
        Metric::Manhattan => manhattan_backward(a, b, grad_raw.view()),
        Metric::Chebyshev => chebyshev_backward(a, b, grad_raw.view()),
        Metric::Cosine => cosine_backward(a, b, grad_raw.view()),
    })
}

/// `|a_i|^2 + |b_j|^2 - 2 a_i.b_j`, clamped at zero
fn squared_euclidean(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let a_sq = a.map_axis(Axis(1), |row| row.dot(&row));
    let b_sq = b.map_axis(Axis(1), |row| row.dot(&row));
    let mut d = a.dot(&b.t()) * -2.0;
    d += &a_sq.insert_axis(Axis(1));
    d += &b_sq.insert_axis(Axis(0));
    // `f64::max` would swallow NaN.
    d.mapv_inplace(|x| if x < 0.0 { 0.0 } else { x });
    d
}

fn squared_euclidean_backward(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    g: ArrayView2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    // dA_i = 2 (sum_j g_ij) a_i - 2 (G B)_i ; dB_j = 2 (sum_i g_ij) b_j - 2 (G^T A)_j
    let row_sums = g.sum_axis(Axis(1)).insert_axis(Axis(1));
    let col_sums = g.sum_axis(Axis(0)).insert_axis(Axis(1));
    let grad_a = (&a * &row_sums - g.dot(&b)) * 2.0;
    let grad_b = (&b * &col_sums - g.t().dot(&a)) * 2.0;
    (grad_a, grad_b)
}

fn elementwise_reduce(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    reduce: impl Fn(f64, f64) -> f64,
) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        a.row(i)
            .iter()
            .zip(b.row(j).iter())
            .fold(0.0, |acc, (&x, &y)| reduce(acc, x - y))
    })
}

fn manhattan_backward(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    g: ArrayView2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let mut grad_a = Array2::zeros(a.raw_dim());
    let mut grad_b = Array2::zeros(b.raw_dim());
    for i in 0..a.nrows() {
        for j in 0..b.nrows() {
            let gij = g[[i, j]];
            for k in 0..a.ncols() {
                let s = sign(a[[i, k]] - b[[j, k]]);
                grad_a[[i, k]] += gij * s;
                grad_b[[j, k]] -= gij * s;
            }
        }
    }
    (grad_a, grad_b)
}

fn chebyshev_backward(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    g: ArrayView2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let mut grad_a = Array2::zeros(a.raw_dim());
    let mut grad_b = Array2::zeros(b.raw_dim());
    if a.ncols() == 0 {
        return (grad_a, grad_b);
    }
    for i in 0..a.nrows() {
        for j in 0..b.nrows() {
            // First maximizing coordinate takes the whole gradient.
            let (k, diff) = a
                .row(i)
                .iter()
                .zip(b.row(j).iter())
                .map(|(&x, &y)| x - y)
                .enumerate()
                .fold((0, 0.0_f64), |best, (k, d)| {
                    if d.abs() > best.1.abs() {
                        (k, d)
                    } else {
                        best
                    }
                });
            let s = sign(diff) * g[[i, j]];
            grad_a[[i, k]] += s;
            grad_b[[j, k]] -= s;
        }
    }
    (grad_a, grad_b)
}

/// Unit-normalize rows; returns the normalized matrix and the clamped norms.
fn normalize_rows(x: ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let norms = x.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(COSINE_NORM_EPSILON));
    let normalized = &x / &norms.view().insert_axis(Axis(1));
    (normalized, norms)
}

/// Gradient through `x_hat = x / max(|x|, eps)` given `d x_hat`.
fn normalize_rows_backward(
    x_hat: &Array2<f64>,
    norms: &Array1<f64>,
    grad_hat: Array2<f64>,
) -> Array2<f64> {
    let mut grad = grad_hat;
    for ((mut g, h), &n) in grad
        .axis_iter_mut(Axis(0))
        .zip(x_hat.axis_iter(Axis(0)))
        .zip(norms.iter())
    {
        if n > COSINE_NORM_EPSILON {
            let proj = h.dot(&g);
            g.zip_mut_with(&h, |gk, &hk| *gk -= proj * hk);
        }
        g.mapv_inplace(|v| v / n);
    }
    grad
}

fn cosine_backward(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    g: ArrayView2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let (a_hat, a_norms) = normalize_rows(a);
    let (b_hat, b_norms) = normalize_rows(b);
    let grad_a_hat = g.dot(&b_hat);
    let grad_b_hat = g.t().dot(&a_hat);
    (
        normalize_rows_backward(&a_hat, &a_norms, grad_a_hat),
        normalize_rows_backward(&b_hat, &b_norms, grad_b_hat),
    )
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use proptest::prelude::*;

    fn sample_a() -> Array2<f64> {
        array![[0.0, 1.0, 2.0], [1.5, -0.5, 0.25], [-2.0, 0.75, 1.0]]
    }

    fn sample_b() -> Array2<f64> {
        array![[1.0, 0.0, -1.0], [0.3, 0.9, 2.2]]
    }

    #[test]
    fn test_known_distances() {
        let a = array![[0.0, 0.0]];
        let b = array![[3.0, -4.0]];
        let d = |m| pairwise(a.view(), b.view(), m).unwrap()[[0, 0]];
        assert_abs_diff_eq!(d(Metric::SquaredEuclidean), 25.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d(Metric::Euclidean), 5.0, epsilon = 1e-8);
        assert_abs_diff_eq!(d(Metric::Manhattan), 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d(Metric::Chebyshev), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_self_similarity_diagonals() {
        let a = sample_a();
        let t = 0.5;
        let sq = scaled_similarity(a.view(), a.view(), Metric::SquaredEuclidean, t).unwrap();
        let eu = scaled_similarity(a.view(), a.view(), Metric::Euclidean, t).unwrap();
        let cos = scaled_similarity(a.view(), a.view(), Metric::Cosine, t).unwrap();
        for i in 0..a.nrows() {
            assert_abs_diff_eq!(sq[[i, i]], 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(eu[[i, i]], 0.0, epsilon = 1e-3);
            assert_abs_diff_eq!(cos[[i, i]], 1.0 / t, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_distance_metrics_are_symmetric_on_same_stack() {
        let a = sample_a();
        for metric in [Metric::SquaredEuclidean, Metric::Euclidean, Metric::Manhattan, Metric::Chebyshev] {
            let d = pairwise(a.view(), a.view(), metric).unwrap();
            for i in 0..3 {
                for j in 0..3 {
                    assert_abs_diff_eq!(d[[i, j]], d[[j, i]], epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_cosine_zero_row_is_finite() {
        let a = array![[0.0, 0.0], [1.0, 0.0]];
        let s = scaled_similarity(a.view(), a.view(), Metric::Cosine, 1.0).unwrap();
        assert!(s.iter().all(|x| x.is_finite()));
        assert_eq!(s[[0, 0]], 0.0);
    }

    #[test]
    fn test_rejects_bad_temperature_and_shapes() {
        let a = sample_a();
        for t in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                scaled_similarity(a.view(), a.view(), Metric::Cosine, t),
                Err(CycleAlignError::InvalidConfiguration(_))
            ));
        }
        let narrow = array![[1.0, 2.0]];
        assert!(matches!(
            pairwise(a.view(), narrow.view(), Metric::Manhattan),
            Err(CycleAlignError::ShapeMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let a = sample_a();
        let b = sample_b();
        let upstream = array![[0.5, -1.0], [2.0, 0.25], [-0.75, 1.5]];
        for metric in Metric::ALL {
            let t = 0.7;
            let (grad_a, grad_b) =
                scaled_similarity_backward(a.view(), b.view(), metric, t, upstream.view()).unwrap();

            let fa = |x: &Array2<f64>| {
                (&scaled_similarity(x.view(), b.view(), metric, t).unwrap() * &upstream).sum()
            };
            let fb = |x: &Array2<f64>| {
                (&scaled_similarity(a.view(), x.view(), metric, t).unwrap() * &upstream).sum()
            };
            let num_a = crate::utils::numerical_gradient(&a, fa, 1e-6);
            let num_b = crate::utils::numerical_gradient(&b, fb, 1e-6);
            for (x, y) in grad_a.iter().zip(num_a.iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-5);
            }
            for (x, y) in grad_b.iter().zip(num_b.iter()) {
                assert_abs_diff_eq!(x, y, epsilon = 1e-5);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_shape_is_rows_by_rows(
            m in 1usize..6,
            n in 1usize..6,
            d in 1usize..5,
            seed in any::<u64>(),
        ) {
            let a = crate::utils::random_matrix(m, d, seed);
            let b = crate::utils::random_matrix(n, d, seed.wrapping_add(1));
            for metric in Metric::ALL {
                let s = scaled_similarity(a.view(), b.view(), metric, 1.0).unwrap();
                prop_assert_eq!(s.dim(), (m, n));
            }
        }
    }
}
