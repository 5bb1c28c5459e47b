//! Tape: the record of operations executed while gradients are requested.
//!
//! Eager execution appends nodes in the order ops run, so the tape is
//! already topologically sorted; walking it in reverse visits every use of
//! a tensor after its producer.
//!
//! Each node saves the input data its backward rule needs *by value*. The
//! arena may reclaim an intermediate long before backward runs (nested
//! `tidy` blocks do exactly that), so the tape never reads the arena; the
//! [`TensorId`]s it carries serve only as accumulation keys, kept unique by
//! slot generations.

use smallvec::SmallVec;

use crate::arena::TensorId;
use crate::types::{PoolMode, Shape};

/// An input buffer copied out of the arena at record time.
#[derive(Clone)]
pub struct Saved {
    pub data: Vec<f32>,
    pub shape: Shape,
}

/// Reduction flavor shared by the reduce primitive and its backward rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceMode {
    Sum,
    Mean,
    Max,
    Min,
}

/// Per-op payload for the backward pass.
///
/// Binary ops record after broadcasting, so both operands of a recorded
/// binary node share the output shape; gradient reduction over stretched
/// dimensions belongs to the `BroadcastTo` node that produced them.
pub enum OpRecord {
    Add,
    Sub,
    Mul { lhs: Saved, rhs: Saved },
    Div { lhs: Saved, rhs: Saved },
    Neg,
    Sin { input: Saved },
    Cos { input: Saved },
    Exp { input: Saved },
    Log { input: Saved },
    Relu { input: Saved },
    Matmul {
        lhs: Saved,
        rhs: Saved,
        transpose_lhs: bool,
        transpose_rhs: bool,
    },
    BatchMatmul {
        lhs: Saved,
        rhs: Saved,
        transpose_lhs: bool,
        transpose_rhs: bool,
    },
    Dot { lhs: Saved, rhs: Saved },
    Reshape { input_shape: Shape },
    Transpose { perm: Vec<usize> },
    BroadcastTo { input_shape: Shape },
    /// Single-axis reduction with the reduced axis kept as size 1.
    Reduce {
        mode: ReduceMode,
        axis: usize,
        input: Saved,
    },
    IndexOneHot {
        index: Vec<i32>,
        axis: usize,
        input_shape: Shape,
    },
    Conv2d {
        input: Saved,
        weight: Saved,
        stride: usize,
        padding: usize,
    },
    Pool2d {
        input: Saved,
        kernel: usize,
        stride: usize,
        padding: usize,
        mode: PoolMode,
    },
}

/// One recorded operation.
pub struct TapeNode {
    pub inputs: SmallVec<[TensorId; 2]>,
    pub output: TensorId,
    pub record: OpRecord,
}

/// Append-only op record, in execution order.
#[derive(Default)]
pub struct Tape {
    pub nodes: Vec<TapeNode>,
}

impl Tape {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn push(&mut self, node: TapeNode) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
