//! Optimizers for tangram training loops.
//!
//! Parameters are arena tensors updated in place with `sub_`, which the
//! tape never records, so optimizer steps leave no trace in the gradient
//! record. Each step runs inside a scope so its temporaries are reclaimed
//! immediately.

use tangram_autograd::GradManager;
use tangram_core::{DType, Result, TangramError, Tensor};
use tracing::trace;

/// One in-place update step from the gradients held by a [`GradManager`].
pub trait Optimizer {
    fn step(&mut self, gm: &GradManager) -> Result<()>;
}

// ── SGD ──────────────────────────────────────────────────────────────────

/// Stochastic gradient descent with optional momentum.
pub struct Sgd {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    velocity: Vec<Tensor>,
}

impl Sgd {
    /// `momentum = 0.0` is plain SGD; velocity buffers are only allocated
    /// when momentum is used.
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Result<Self> {
        let velocity = if momentum == 0.0 {
            Vec::new()
        } else {
            let mut velocity = Vec::with_capacity(params.len());
            for p in &params {
                if p.dtype() != DType::F32 {
                    return Err(TangramError::DTypeMismatch {
                        expected: DType::F32,
                        got: p.dtype(),
                    });
                }
                let v = p.engine().zeros(&p.shape().0, DType::F32)?;
                p.engine().keep(&v)?;
                velocity.push(v);
            }
            velocity
        };
        Ok(Self {
            params,
            lr,
            momentum,
            velocity,
        })
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, gm: &GradManager) -> Result<()> {
        for (i, param) in self.params.iter().enumerate() {
            let Some(grad) = gm.grad(param) else {
                continue;
            };
            let engine = param.engine().clone();
            engine.scoped(Some("sgd-step"), || {
                if self.momentum == 0.0 {
                    let update = grad.mul_scalar(self.lr)?;
                    param.sub_(&update)?;
                } else {
                    // v = momentum * v + g; p -= lr * v
                    let v = &self.velocity[i];
                    let blended = v.mul_scalar(self.momentum)?.add(grad)?;
                    v.copy_from(&blended)?;
                    param.sub_(&v.mul_scalar(self.lr)?)?;
                }
                trace!(param = ?param.id(), "sgd update");
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl Drop for Sgd {
    fn drop(&mut self) {
        for v in &self.velocity {
            let engine = v.engine().clone();
            let _ = engine.dispose(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_core::Engine;

    #[test]
    fn test_sgd_moves_against_gradient() {
        let engine = Engine::new();
        let x = engine.tensor(&[4.0], &[1]).unwrap();
        let mut gm = GradManager::new();
        gm.attach(&[&x]);
        let mut opt = Sgd::new(vec![x.clone()], 0.25, 0.0).unwrap();

        // loss = x^2, so one step moves x to 4 - 0.25 * 8 = 2.
        let xc = x.clone();
        gm.run(&engine, move || xc.square()).unwrap();
        opt.step(&gm).unwrap();
        assert_eq!(x.to_vec_f32().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_momentum_accumulates() {
        let engine = Engine::new();
        let x = engine.tensor(&[0.0], &[1]).unwrap();
        let mut gm = GradManager::new();
        gm.attach(&[&x]);
        let mut opt = Sgd::new(vec![x.clone()], 0.1, 0.9).unwrap();

        // Constant gradient of 1: velocity grows 1, 1.9, 2.71, ...
        for _ in 0..2 {
            let xc = x.clone();
            gm.run(&engine, move || xc.add_scalar(0.0)?.sum(None, false))
                .unwrap();
            opt.step(&gm).unwrap();
        }
        let v = x.to_vec_f32().unwrap()[0];
        assert!((v - (-0.1 - 0.19)).abs() < 1e-6, "got {v}");
    }

    #[test]
    fn test_step_without_grad_is_noop() {
        let engine = Engine::new();
        let x = engine.tensor(&[1.0], &[1]).unwrap();
        let gm = GradManager::new();
        let mut opt = Sgd::new(vec![x.clone()], 0.1, 0.0).unwrap();
        opt.step(&gm).unwrap();
        assert_eq!(x.to_vec_f32().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_step_leaves_no_temporaries() {
        let engine = Engine::new();
        let x = engine.tensor(&[1.0, 2.0], &[2]).unwrap();
        let mut gm = GradManager::new();
        gm.attach(&[&x]);
        let xc = x.clone();
        gm.run(&engine, move || xc.square()?.sum(None, false)).unwrap();
        let before = engine.live_tensors();
        let mut opt = Sgd::new(vec![x.clone()], 0.1, 0.0).unwrap();
        opt.step(&gm).unwrap();
        assert_eq!(engine.live_tensors(), before);
    }
}
