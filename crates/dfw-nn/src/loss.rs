use dfw_tensor::{sigmoid, Tensor};

/// Binary cross-entropy on raw logits, averaged over every element.
///
/// Uses `max(x, 0) - x*y + ln(1 + exp(-|x|))`, which never overflows.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> f64 {
    assert_eq!(
        logits.shape(),
        targets.shape(),
        "bce_with_logits: logits and targets must have the same shape"
    );
    if logits.numel() == 0 {
        return 0.0;
    }
    let total: f64 = logits
        .data()
        .iter()
        .zip(targets.data())
        .map(|(&x, &y)| x.max(0.0) - x * y + (-x.abs()).exp().ln_1p())
        .sum();
    total / logits.numel() as f64
}

/// Gradient of [`bce_with_logits`] w.r.t. the logits: `(sigmoid(x) - y) / n`.
pub fn bce_with_logits_grad(logits: &Tensor, targets: &Tensor) -> Tensor {
    let n = logits.numel().max(1) as f64;
    logits.zip_with(targets, |x, y| (sigmoid(x) - y) / n)
}

/// Mean over the batch of each sample's L2 norm.
pub fn mean_l2_norm(x: &Tensor) -> f64 {
    let norms = x.row_norms();
    if norms.is_empty() {
        return 0.0;
    }
    norms.iter().sum::<f64>() / norms.len() as f64
}

/// Gradient of [`mean_l2_norm`]: `x_i / (N * |x_i|)` per sample.
///
/// A sample with zero norm has no defined gradient; it gets zero.
pub fn mean_l2_norm_grad(x: &Tensor) -> Tensor {
    let norms = x.row_norms();
    let batch = norms.len().max(1) as f64;
    let width = x.shape().inner().numel().max(1);
    let mut grad = x.clone();
    for (chunk, &norm) in grad.data_mut().chunks_mut(width).zip(&norms) {
        if norm == 0.0 {
            chunk.iter_mut().for_each(|v| *v = 0.0);
        } else {
            chunk.iter_mut().for_each(|v| *v /= batch * norm);
        }
    }
    grad
}
