//! Reverse-mode automatic differentiation over the tangram tape.
//!
//! [`GradManager`] is the training-loop entry point: attach the parameters
//! you want gradients for, wrap each forward pass in [`GradManager::run`],
//! then read the per-parameter gradients back with [`GradManager::grad`].
//!
//! `run` opens a dedicated scope and turns recording on for the duration
//! of the forward closure. The backward walk happens with recording off,
//! inside the same scope, so every intermediate it creates is reclaimed
//! when the scope closes; only the gradients of attached parameters are
//! kept alive (and disposed again on the next `run` or on `clear`).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use tangram_core::arena::TensorId;
use tangram_core::{Engine, Result, TangramError, Tensor};

pub mod vjp;

pub use vjp::vjp;

/// Records forward passes and computes gradients for attached parameters.
#[derive(Default)]
pub struct GradManager {
    attached: Vec<Tensor>,
    grads: HashMap<TensorId, Tensor>,
}

impl GradManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark parameters as gradient targets. Attaching the same handle
    /// twice is a no-op.
    pub fn attach(&mut self, params: &[&Tensor]) {
        for p in params {
            if !self.attached.iter().any(|q| q.id() == p.id()) {
                self.attached.push((*p).clone());
            }
        }
    }

    /// Forget all attachments and drop any held gradients.
    pub fn detach_all(&mut self) {
        self.attached.clear();
        self.clear();
    }

    /// Record `f`, backpropagate from its scalar-shaped result, and store
    /// gradients for every attached parameter the result depends on.
    /// Returns the loss value.
    ///
    /// Gradients from a previous `run` are disposed and replaced.
    pub fn run<F>(&mut self, engine: &Arc<Engine>, f: F) -> Result<f32>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        engine.start_scope(Some("backward"));
        engine.start_recording();
        let outcome = self.run_inner(engine, f);
        match outcome {
            Ok((loss, kept)) => {
                self.clear();
                self.grads = kept;
                engine.end_scope(None);
                Ok(loss)
            }
            Err(e) => {
                let _ = engine.stop_recording();
                engine.end_scope(None);
                Err(e)
            }
        }
    }

    fn run_inner<F>(
        &mut self,
        engine: &Arc<Engine>,
        f: F,
    ) -> Result<(f32, HashMap<TensorId, Tensor>)>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        let loss = f()?;
        let tape = engine.stop_recording();
        if loss.numel() != 1 {
            return Err(TangramError::InvalidArgument(format!(
                "backward requires a single-element loss, shape is {}",
                loss.shape()
            )));
        }
        let loss_value = loss.item_f32()?;
        debug!(nodes = tape.len(), loss = loss_value, "backward pass");

        let mut grads: HashMap<TensorId, Tensor> = HashMap::new();
        grads.insert(loss.id(), engine.ones(&loss.shape().0, loss.dtype())?);

        // The tape is in execution order, so the reverse walk sees every
        // consumer of a tensor before its producer.
        for node in tape.nodes.iter().rev() {
            let Some(grad_output) = grads.get(&node.output).cloned() else {
                continue;
            };
            let input_grads = vjp(&node.record, engine, &grad_output)?;
            trace!(inputs = node.inputs.len(), "vjp");
            for (&id, grad) in node.inputs.iter().zip(input_grads) {
                match grads.entry(id) {
                    Entry::Occupied(mut slot) => {
                        let accumulated = slot.get().add(&grad)?;
                        slot.insert(accumulated);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(grad);
                    }
                }
            }
        }

        let mut kept = HashMap::new();
        for param in &self.attached {
            if let Some(grad) = grads.remove(&param.id()) {
                engine.keep(&grad)?;
                kept.insert(param.id(), grad);
            }
        }
        Ok((loss_value, kept))
    }

    /// Gradient of an attached parameter from the most recent `run`, or
    /// `None` if the loss did not depend on it.
    pub fn grad(&self, param: &Tensor) -> Option<&Tensor> {
        self.grads.get(&param.id())
    }

    /// Dispose all held gradients.
    pub fn clear(&mut self) {
        for (_, grad) in self.grads.drain() {
            let engine = grad.engine().clone();
            let _ = engine.dispose(&grad);
        }
    }
}

impl Drop for GradManager {
    fn drop(&mut self) {
        self.clear();
    }
}
