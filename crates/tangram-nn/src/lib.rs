//! Neural network building blocks on tangram tensors.
//!
//! Layers own their parameters as kept tensors (exempt from scope sweeps),
//! so a layer constructed outside a `tidy` block can be used inside one
//! without losing its weights.

use tangram_core::{Result, Tensor};

pub mod conv;
pub mod linear;
pub mod loss;
pub mod pool;
pub mod sequential;

pub use conv::Conv2d;
pub use linear::Linear;
pub use loss::{cross_entropy, mse};
pub use pool::Pool2d;
pub use sequential::{Lambda, Sequential};

/// A layer: a forward function plus the parameters it owns.
pub trait Module {
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// All trainable parameters, in a stable order.
    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }

    /// Parameters with dotted names under `prefix`, for checkpointing.
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let _ = prefix;
        Vec::new()
    }
}
