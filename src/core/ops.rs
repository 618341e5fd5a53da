//! Row-wise softmax and cross-entropy kernels

use crate::{CycleAlignError, Result};
use ndarray::{Array2, ArrayView2, Axis};

/// Row-wise softmax, max-subtracted.
///
/// Rows containing non-finite logits produce non-finite probabilities.
pub fn softmax_rows(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    out
}

/// Row-wise log-softmax via log-sum-exp.
pub fn log_softmax_rows(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x));
        let lse = max + row.iter().map(|&x| (x - max).exp()).sum::<f64>().ln();
        row.mapv_inplace(|x| x - lse);
    }
    out
}

/// Backward pass of [`softmax_rows`].
///
/// Given the forward output `probs` and the upstream gradient with respect
/// to it, returns the gradient with respect to the logits:
/// `dS_ij = P_ij (dP_ij - sum_k dP_ik P_ik)`.
pub fn softmax_rows_backward(probs: ArrayView2<f64>, grad_probs: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(probs.raw_dim());
    for ((p, g), mut o) in probs
        .axis_iter(Axis(0))
        .zip(grad_probs.axis_iter(Axis(0)))
        .zip(out.axis_iter_mut(Axis(0)))
    {
        let inner = p.dot(&g);
        o.assign(&(&p * &(&g - inner)));
    }
    out
}

/// Mean categorical cross-entropy of each row against its own index.
///
/// Row `i` of `logits` is scored against label `i`, so `logits` must have at
/// least as many columns as rows. Returns the loss and the gradient with
/// respect to the logits, `(softmax(S) - onehot) / m`.
pub fn mean_cross_entropy_identity(logits: ArrayView2<f64>) -> Result<(f64, Array2<f64>)> {
    let (m, classes) = logits.dim();
    if m == 0 {
        return Err(CycleAlignError::EmptyStack("cross-entropy logits"));
    }
    if classes < m {
        return Err(CycleAlignError::ShapeMismatch {
            context: "cross-entropy classes",
            expected: m,
            found: classes,
        });
    }
    let log_probs = log_softmax_rows(logits);
    let loss = -(0..m).map(|i| log_probs[[i, i]]).sum::<f64>() / m as f64;

    let mut grad = log_probs.mapv(f64::exp);
    for i in 0..m {
        grad[[i, i]] -= 1.0;
    }
    grad /= m as f64;
    Ok((loss, grad))
}
