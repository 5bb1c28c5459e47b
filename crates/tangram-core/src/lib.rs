//! Safe, ergonomic tensor engine with eager execution and scoped memory.
//!
//! `tangram-core` provides the foundational types (`Engine`, `Tensor`,
//! `DType`, `Shape`) plus the byte arena that backs every tensor, the scope
//! stack that reclaims intermediates deterministically, and the tape that
//! records operations for reverse-mode differentiation (driven by
//! `tangram-autograd`).
//!
//! There is no global context: an [`Engine`] is an explicit value, and every
//! tensor handle carries an `Arc` to the engine that owns its storage.

pub mod arena;
pub mod engine;
pub mod kernels;
pub mod shape;
pub mod tape;
pub mod tensor;
pub mod types;

pub use arena::TensorId;
pub use engine::Engine;
pub use tape::Tape;
pub use tensor::Tensor;
pub use types::{DType, PoolMode, Shape};

pub type Result<T> = std::result::Result<T, TangramError>;

#[derive(thiserror::Error, Debug)]
pub enum TangramError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: types::DType,
        got: types::DType,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tensor handle refers to freed storage")]
    DeadTensor,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
