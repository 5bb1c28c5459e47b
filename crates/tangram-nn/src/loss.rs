//! Loss functions.

use tangram_core::{Result, Tensor};

/// Mean squared error over all elements.
pub fn mse(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    pred.sub(target)?.square()?.mean(None, false)
}

/// Softmax cross entropy from raw logits.
///
/// `logits` is `[batch, classes]`, `target` is an i32 class-index tensor
/// with one entry per row. Lowered to `mean(logsumexp(logits) - picked)`,
/// which is numerically stable and whose gradient is softmax minus the
/// one-hot target.
pub fn cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let lse = logits.logsumexp(1, true)?;
    let picked = logits.index_one_hot(target, 1, true)?;
    lse.sub(&picked)?.mean(None, false)
}
