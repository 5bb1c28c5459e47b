//! Tensor — an eager handle into the engine's arena.
//!
//! A `Tensor` is a cheap clone: id + shape + dtype + `Arc<Engine>`. Every
//! operation validates, infers the output shape, runs a CPU kernel, places
//! the result in the arena (tracked by the innermost scope), and records a
//! tape node when the engine is recording and the output is differentiable
//! (f32). Comparison, casting, argmax, and the in-place ops never record.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::TensorId;
use crate::engine::Engine;
use crate::kernels;
use crate::shape::{
    insert_axes, remove_axes, resolve_axis, resolve_reshape, squeeze_all_units, window_out_dim,
};
use crate::tape::{OpRecord, ReduceMode, Saved, TapeNode};
use crate::types::{DType, PoolMode, Shape};
use crate::{Result, TangramError};

/// An eager tensor handle.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    dtype: DType,
    engine: Arc<Engine>,
}

enum BinKind {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
}

impl Tensor {
    pub(crate) fn from_raw(id: TensorId, shape: Shape, dtype: DType, engine: Arc<Engine>) -> Self {
        Self {
            id,
            shape,
            dtype,
            engine,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> i64 {
        self.shape.numel()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Byte offset of this tensor's storage within the arena.
    pub fn offset(&self) -> Result<usize> {
        self.engine.lock().arena.offset_of(self.id)
    }

    /// Copy data out as f32. Errors on a dead handle or non-f32 dtype.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.engine.lock().arena.read_f32(self.id)
    }

    /// Copy data out as i32. Errors on a dead handle or non-i32 dtype.
    pub fn to_vec_i32(&self) -> Result<Vec<i32>> {
        self.engine.lock().arena.read_i32(self.id)
    }

    /// Raw storage bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.engine.lock().arena.bytes(self.id)?.to_vec())
    }

    /// The single element of a scalar-shaped f32 tensor.
    pub fn item_f32(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(TangramError::InvalidArgument(format!(
                "item requires a single-element tensor, shape is {}",
                self.shape
            )));
        }
        Ok(self.to_vec_f32()?[0])
    }

    /// Overwrite this tensor's storage with `data`.
    pub fn copy_from_slice_f32(&self, data: &[f32]) -> Result<()> {
        if self.dtype != DType::F32 {
            return Err(TangramError::DTypeMismatch {
                expected: DType::F32,
                got: self.dtype,
            });
        }
        if data.len() != self.numel() as usize {
            return Err(TangramError::InvalidArgument(format!(
                "data length {} does not match shape {}",
                data.len(),
                self.shape
            )));
        }
        self.engine.lock().arena.write_f32(self.id, data)
    }

    /// Overwrite this tensor's storage with another tensor's bytes.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(TangramError::DTypeMismatch {
                expected: self.dtype,
                got: src.dtype,
            });
        }
        if self.shape != src.shape {
            return Err(TangramError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: src.shape.0.clone(),
            });
        }
        let bytes = src.to_bytes()?;
        self.engine.lock().arena.bytes_mut(self.id)?.copy_from_slice(&bytes);
        Ok(())
    }

    fn saved(&self) -> Result<Saved> {
        Ok(Saved {
            data: self.to_vec_f32()?,
            shape: self.shape.clone(),
        })
    }

    fn require_f32(&self, op: &str) -> Result<()> {
        if self.dtype != DType::F32 {
            return Err(TangramError::InvalidArgument(format!(
                "{op} requires f32, got {}",
                self.dtype
            )));
        }
        Ok(())
    }

    fn unsupported(&self, op: &str) -> TangramError {
        TangramError::InvalidArgument(format!("{op} is not supported for dtype {}", self.dtype))
    }

    fn record(&self, inputs: &[TensorId], output: TensorId, record: OpRecord) {
        self.engine.record(TapeNode {
            inputs: SmallVec::from_slice(inputs),
            output,
            record,
        });
    }

    // ── Elementwise binary ──────────────────────────────────────────────

    /// Element-wise addition with broadcasting.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, BinKind::Add)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, BinKind::Sub)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, BinKind::Mul)
    }

    /// Element-wise division with broadcasting. Both operands must be f32.
    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        self.require_f32("div")?;
        rhs.require_f32("div")?;
        self.binary(rhs, BinKind::Div)
    }

    /// Element-wise equality, yielding 0/1 in the left operand's dtype.
    pub fn eq(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, BinKind::Eq)
    }

    fn binary(&self, rhs: &Tensor, kind: BinKind) -> Result<Tensor> {
        if self.dtype != rhs.dtype {
            return Err(TangramError::DTypeMismatch {
                expected: self.dtype,
                got: rhs.dtype,
            });
        }
        let out_shape =
            Shape::broadcast_shapes(&self.shape, &rhs.shape).ok_or(TangramError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: rhs.shape.0.clone(),
            })?;
        let a = self.broadcast_to(&out_shape)?;
        let b = rhs.broadcast_to(&out_shape)?;

        match self.dtype {
            DType::F32 => {
                let xd = a.to_vec_f32()?;
                let yd = b.to_vec_f32()?;
                let data = match kind {
                    BinKind::Add => kernels::zip_binary(&xd, &yd, |x, y| x + y),
                    BinKind::Sub => kernels::zip_binary(&xd, &yd, |x, y| x - y),
                    BinKind::Mul => kernels::zip_binary(&xd, &yd, |x, y| x * y),
                    BinKind::Div => kernels::zip_binary(&xd, &yd, |x, y| x / y),
                    BinKind::Eq => {
                        kernels::zip_binary(&xd, &yd, |x, y| if x == y { 1.0 } else { 0.0 })
                    }
                };
                let out = self.engine.create_f32(data, out_shape.clone())?;
                if self.engine.is_recording() {
                    let record = match kind {
                        BinKind::Add => Some(OpRecord::Add),
                        BinKind::Sub => Some(OpRecord::Sub),
                        BinKind::Mul => Some(OpRecord::Mul {
                            lhs: Saved {
                                data: xd,
                                shape: out_shape.clone(),
                            },
                            rhs: Saved {
                                data: yd,
                                shape: out_shape,
                            },
                        }),
                        BinKind::Div => Some(OpRecord::Div {
                            lhs: Saved {
                                data: xd,
                                shape: out_shape.clone(),
                            },
                            rhs: Saved {
                                data: yd,
                                shape: out_shape,
                            },
                        }),
                        BinKind::Eq => None,
                    };
                    if let Some(record) = record {
                        self.record(&[a.id, b.id], out.id, record);
                    }
                }
                Ok(out)
            }
            DType::I32 => {
                let xd = a.to_vec_i32()?;
                let yd = b.to_vec_i32()?;
                let data = match kind {
                    BinKind::Add => kernels::zip_binary(&xd, &yd, |x, y| x.wrapping_add(y)),
                    BinKind::Sub => kernels::zip_binary(&xd, &yd, |x, y| x.wrapping_sub(y)),
                    BinKind::Mul => kernels::zip_binary(&xd, &yd, |x, y| x.wrapping_mul(y)),
                    BinKind::Eq => kernels::zip_binary(&xd, &yd, |x, y| i32::from(x == y)),
                    BinKind::Div => return Err(self.unsupported("div")),
                };
                self.engine.create_i32(data, out_shape)
            }
            _ => Err(self.unsupported("binary op")),
        }
    }

    // ── Scalar conveniences ─────────────────────────────────────────────

    fn scalar_rhs(&self, v: f32) -> Result<Tensor> {
        match self.dtype {
            DType::F32 => self.engine.scalar(v),
            DType::I32 => self.engine.scalar_i32(v as i32),
            _ => Err(self.unsupported("scalar op")),
        }
    }

    pub fn add_scalar(&self, v: f32) -> Result<Tensor> {
        self.add(&self.scalar_rhs(v)?)
    }

    pub fn sub_scalar(&self, v: f32) -> Result<Tensor> {
        self.sub(&self.scalar_rhs(v)?)
    }

    pub fn mul_scalar(&self, v: f32) -> Result<Tensor> {
        self.mul(&self.scalar_rhs(v)?)
    }

    pub fn div_scalar(&self, v: f32) -> Result<Tensor> {
        self.div(&self.engine.scalar(v)?)
    }

    // ── In-place ops (never recorded) ───────────────────────────────────

    /// In-place addition. Shapes must match exactly; the tape never sees
    /// in-place updates, which is what lets optimizers adjust parameters
    /// without polluting the gradient record.
    pub fn add_(&self, rhs: &Tensor) -> Result<()> {
        self.inplace(rhs, true)
    }

    /// In-place subtraction. Same rules as [`Tensor::add_`].
    pub fn sub_(&self, rhs: &Tensor) -> Result<()> {
        self.inplace(rhs, false)
    }

    fn inplace(&self, rhs: &Tensor, add: bool) -> Result<()> {
        if self.dtype != rhs.dtype {
            return Err(TangramError::DTypeMismatch {
                expected: self.dtype,
                got: rhs.dtype,
            });
        }
        if self.shape != rhs.shape {
            return Err(TangramError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: rhs.shape.0.clone(),
            });
        }
        match self.dtype {
            DType::F32 => {
                let a = self.to_vec_f32()?;
                let b = rhs.to_vec_f32()?;
                let data =
                    kernels::zip_binary(&a, &b, |x, y| if add { x + y } else { x - y });
                self.engine.lock().arena.write_f32(self.id, &data)
            }
            DType::I32 => {
                let a = self.to_vec_i32()?;
                let b = rhs.to_vec_i32()?;
                let data = kernels::zip_binary(&a, &b, |x, y| {
                    if add {
                        x.wrapping_add(y)
                    } else {
                        x.wrapping_sub(y)
                    }
                });
                self.engine.lock().arena.write_i32(self.id, &data)
            }
            _ => Err(self.unsupported("in-place op")),
        }
    }

    // ── Unary ───────────────────────────────────────────────────────────

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Tensor> {
        match self.dtype {
            DType::F32 => {
                let data = self.to_vec_f32()?;
                let out = self
                    .engine
                    .create_f32(kernels::map_unary(&data, |x| -x), self.shape.clone())?;
                if self.engine.is_recording() {
                    self.record(&[self.id], out.id, OpRecord::Neg);
                }
                Ok(out)
            }
            DType::I32 => {
                let data = self.to_vec_i32()?;
                self.engine
                    .create_i32(kernels::map_unary(&data, |x| -x), self.shape.clone())
            }
            _ => Err(self.unsupported("neg")),
        }
    }

    fn unary_f32(
        &self,
        op: &str,
        f: impl Fn(f32) -> f32,
        make_record: impl FnOnce(Saved) -> OpRecord,
    ) -> Result<Tensor> {
        self.require_f32(op)?;
        let data = self.to_vec_f32()?;
        let out = self
            .engine
            .create_f32(kernels::map_unary(&data, f), self.shape.clone())?;
        if self.engine.is_recording() {
            let saved = Saved {
                data,
                shape: self.shape.clone(),
            };
            self.record(&[self.id], out.id, make_record(saved));
        }
        Ok(out)
    }

    pub fn sin(&self) -> Result<Tensor> {
        self.unary_f32("sin", f32::sin, |input| OpRecord::Sin { input })
    }

    pub fn cos(&self) -> Result<Tensor> {
        self.unary_f32("cos", f32::cos, |input| OpRecord::Cos { input })
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary_f32("exp", f32::exp, |input| OpRecord::Exp { input })
    }

    pub fn log(&self) -> Result<Tensor> {
        self.unary_f32("log", f32::ln, |input| OpRecord::Log { input })
    }

    /// Rectified linear unit.
    pub fn relu(&self) -> Result<Tensor> {
        match self.dtype {
            DType::F32 => self.unary_f32("relu", |x| x.max(0.0), |input| OpRecord::Relu { input }),
            DType::I32 => {
                let data = self.to_vec_i32()?;
                self.engine
                    .create_i32(kernels::map_unary(&data, |x| x.max(0)), self.shape.clone())
            }
            _ => Err(self.unsupported("relu")),
        }
    }

    /// Element-wise square, lowered to `mul(self, self)` so its gradient
    /// falls out of the product rule.
    pub fn square(&self) -> Result<Tensor> {
        self.mul(self)
    }

    /// Logistic sigmoid, lowered to `1 / (1 + exp(-x))` so its gradient
    /// flows through the recorded primitives.
    pub fn sigmoid(&self) -> Result<Tensor> {
        self.require_f32("sigmoid")?;
        let denom = self.neg()?.exp()?.add_scalar(1.0)?;
        self.engine.scalar(1.0)?.div(&denom)
    }

    // ── Shape ops ───────────────────────────────────────────────────────

    /// Reshape; one dimension may be the wildcard `-1`.
    pub fn reshape(&self, dims: &[i64]) -> Result<Tensor> {
        let new_shape = resolve_reshape(&self.shape, dims)?;
        self.copy_reshaped(new_shape)
    }

    /// Flatten to rank 1.
    pub fn flatten(&self) -> Result<Tensor> {
        self.reshape(&[-1])
    }

    /// Insert size-1 axes.
    pub fn add_axis(&self, axes: &[i64]) -> Result<Tensor> {
        let new_shape = insert_axes(&self.shape, axes)?;
        self.copy_reshaped(new_shape)
    }

    /// Remove size-1 axes; removing a larger axis names it in the error.
    pub fn remove_axis(&self, axes: &[i64]) -> Result<Tensor> {
        let new_shape = remove_axes(&self.shape, axes)?;
        self.copy_reshaped(new_shape)
    }

    /// [`Tensor::add_axis`] for a single axis, defaulting to the end.
    pub fn unsqueeze(&self, axis: Option<i64>) -> Result<Tensor> {
        self.add_axis(&[axis.unwrap_or(-1)])
    }

    /// [`Tensor::remove_axis`] for a single axis, defaulting to the last.
    pub fn squeeze(&self, axis: Option<i64>) -> Result<Tensor> {
        self.remove_axis(&[axis.unwrap_or(-1)])
    }

    fn copy_reshaped(&self, new_shape: Shape) -> Result<Tensor> {
        let bytes = self.to_bytes()?;
        let out = self.engine.create_raw(bytes, new_shape, self.dtype)?;
        if self.dtype == DType::F32 && self.engine.is_recording() {
            self.record(
                &[self.id],
                out.id(),
                OpRecord::Reshape {
                    input_shape: self.shape.clone(),
                },
            );
        }
        Ok(out)
    }

    /// Permute axes; `None` reverses them all.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Tensor> {
        let ndim = self.shape.ndim();
        let perm: Vec<usize> = match axes {
            Some(ax) => {
                let mut seen = vec![false; ndim];
                for &a in ax {
                    if a >= ndim || seen[a] {
                        return Err(TangramError::InvalidArgument(format!(
                            "transpose axes {ax:?} are not a permutation of 0..{ndim}"
                        )));
                    }
                    seen[a] = true;
                }
                if ax.len() != ndim {
                    return Err(TangramError::InvalidArgument(format!(
                        "transpose axes {ax:?} are not a permutation of 0..{ndim}"
                    )));
                }
                ax.to_vec()
            }
            None => (0..ndim).rev().collect(),
        };
        let new_dims: Vec<i64> = perm.iter().map(|&ax| self.shape.0[ax]).collect();
        let new_shape = Shape::new(new_dims);

        let out = match self.dtype {
            DType::F32 => {
                let data = self.to_vec_f32()?;
                self.engine
                    .create_f32(kernels::transpose(&data, &self.shape, &perm), new_shape)?
            }
            DType::I32 => {
                let data = self.to_vec_i32()?;
                self.engine
                    .create_i32(kernels::transpose(&data, &self.shape, &perm), new_shape)?
            }
            _ => return Err(self.unsupported("transpose")),
        };
        if self.dtype == DType::F32 && self.engine.is_recording() {
            self.record(&[self.id], out.id(), OpRecord::Transpose { perm });
        }
        Ok(out)
    }

    /// Broadcast to `target` (numpy-style rules). Broadcasting to the
    /// current shape returns a clone of the handle.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Tensor> {
        if &self.shape == target {
            return Ok(self.clone());
        }
        // Dimensions are compared from the right.
        let in_ndim = self.shape.ndim();
        let out_ndim = target.ndim();
        if in_ndim > out_ndim {
            return Err(TangramError::InvalidArgument(format!(
                "cannot broadcast shape {} to {}",
                self.shape, target
            )));
        }
        let pad = out_ndim - in_ndim;
        for i in 0..in_ndim {
            let in_dim = self.shape.0[i];
            let out_dim = target.0[pad + i];
            if in_dim != 1 && in_dim != out_dim {
                return Err(TangramError::InvalidArgument(format!(
                    "cannot broadcast shape {} to {}",
                    self.shape, target
                )));
            }
        }

        let out = match self.dtype {
            DType::F32 => {
                let data = self.to_vec_f32()?;
                self.engine.create_f32(
                    kernels::broadcast(&data, &self.shape, target),
                    target.clone(),
                )?
            }
            DType::I32 => {
                let data = self.to_vec_i32()?;
                self.engine.create_i32(
                    kernels::broadcast(&data, &self.shape, target),
                    target.clone(),
                )?
            }
            _ => return Err(self.unsupported("broadcast_to")),
        };
        if self.dtype == DType::F32 && self.engine.is_recording() {
            self.record(
                &[self.id],
                out.id(),
                OpRecord::BroadcastTo {
                    input_shape: self.shape.clone(),
                },
            );
        }
        Ok(out)
    }

    // ── Matmul family ───────────────────────────────────────────────────

    /// Matrix multiplication. See [`Tensor::matmul_t`] for the full
    /// dispatch rules.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.matmul_t(rhs, false, false)
    }

    /// Matrix multiplication with transpose flags.
    ///
    /// - 1-D × 1-D is a dot product with scalar-shaped (`[1]`) output.
    /// - A 1-D operand is lifted to a row (lhs) or column (rhs) vector and
    ///   the lifted axis squeezed from the result.
    /// - For rank ≥ 3 the leading dims are batch dims; a lower-rank operand
    ///   has its batch dims broadcast, equal ranks must match exactly.
    /// - Ranks above 3 are flattened to `[-1, rows, cols]` and reshaped back.
    ///
    /// The result dtype follows the left operand.
    pub fn matmul_t(&self, rhs: &Tensor, transpose_a: bool, transpose_b: bool) -> Result<Tensor> {
        self.require_f32("matmul")?;
        rhs.require_f32("matmul")?;
        let da = self.shape.ndim();
        let db = rhs.shape.ndim();

        if da == 1 && db == 1 {
            return self.dot(rhs);
        }
        if da == 1 {
            let lifted = self.add_axis(&[0])?;
            let out = lifted.matmul_t(rhs, transpose_a, transpose_b)?;
            return out.remove_axis(&[-2]);
        }
        if db == 1 {
            let lifted = rhs.add_axis(&[1])?;
            let out = self.matmul_t(&lifted, transpose_a, transpose_b)?;
            return out.remove_axis(&[-1]);
        }

        if da == 2 && db == 2 {
            return self.matmul_2d(rhs, transpose_a, transpose_b);
        }

        // Broadcast the lower-rank operand's batch dims up.
        if da != db {
            if da > db {
                let mut target = self.shape.0[..da - 2].to_vec();
                target.extend_from_slice(&rhs.shape.0[db - 2..]);
                let lifted = rhs.broadcast_to(&Shape::new(target))?;
                return self.matmul_t(&lifted, transpose_a, transpose_b);
            } else {
                let mut target = rhs.shape.0[..db - 2].to_vec();
                target.extend_from_slice(&self.shape.0[da - 2..]);
                let lifted = self.broadcast_to(&Shape::new(target))?;
                return lifted.matmul_t(rhs, transpose_a, transpose_b);
            }
        }

        // Equal ranks >= 3: batch dims must match exactly.
        for i in 0..da - 2 {
            if self.shape.0[i] != rhs.shape.0[i] {
                return Err(TangramError::InvalidArgument(format!(
                    "matmul batch dimension mismatch at axis {i}: {} vs {}",
                    self.shape.0[i], rhs.shape.0[i]
                )));
            }
        }

        if da == 3 {
            return self.batch_matmul_3d(rhs, transpose_a, transpose_b);
        }

        // Flatten the batch, multiply, restore the batch dims.
        let lead = self.shape.0[..da - 2].to_vec();
        let a3 = self.reshape(&[-1, self.shape.0[da - 2], self.shape.0[da - 1]])?;
        let b3 = rhs.reshape(&[-1, rhs.shape.0[db - 2], rhs.shape.0[db - 1]])?;
        let out = a3.batch_matmul_3d(&b3, transpose_a, transpose_b)?;
        let mut final_dims = lead;
        final_dims.extend_from_slice(&out.shape.0[1..]);
        out.reshape(&final_dims)
    }

    fn matmul_2d(&self, rhs: &Tensor, ta: bool, tb: bool) -> Result<Tensor> {
        let (m, k) = logical_mat_dims(&self.shape.0[0..2], ta);
        let (k2, n) = logical_mat_dims(&rhs.shape.0[0..2], tb);
        if k != k2 {
            return Err(TangramError::InvalidArgument(format!(
                "matmul inner dimension mismatch: {k} vs {k2}"
            )));
        }
        let a = self.to_vec_f32()?;
        let b = rhs.to_vec_f32()?;
        let data = kernels::matmul_2d(&a, &b, m as usize, k as usize, n as usize, ta, tb);
        let out = self.engine.create_f32(data, Shape::new(vec![m, n]))?;
        if self.engine.is_recording() {
            self.record(
                &[self.id, rhs.id],
                out.id(),
                OpRecord::Matmul {
                    lhs: Saved {
                        data: a,
                        shape: self.shape.clone(),
                    },
                    rhs: Saved {
                        data: b,
                        shape: rhs.shape.clone(),
                    },
                    transpose_lhs: ta,
                    transpose_rhs: tb,
                },
            );
        }
        Ok(out)
    }

    fn batch_matmul_3d(&self, rhs: &Tensor, ta: bool, tb: bool) -> Result<Tensor> {
        let batch = self.shape.0[0];
        let (m, k) = logical_mat_dims(&self.shape.0[1..3], ta);
        let (k2, n) = logical_mat_dims(&rhs.shape.0[1..3], tb);
        if k != k2 {
            return Err(TangramError::InvalidArgument(format!(
                "matmul inner dimension mismatch: {k} vs {k2}"
            )));
        }
        let a = self.to_vec_f32()?;
        let b = rhs.to_vec_f32()?;
        let data = kernels::batch_matmul(
            &a,
            &b,
            batch as usize,
            m as usize,
            k as usize,
            n as usize,
            ta,
            tb,
        );
        let out = self
            .engine
            .create_f32(data, Shape::new(vec![batch, m, n]))?;
        if self.engine.is_recording() {
            self.record(
                &[self.id, rhs.id],
                out.id(),
                OpRecord::BatchMatmul {
                    lhs: Saved {
                        data: a,
                        shape: self.shape.clone(),
                    },
                    rhs: Saved {
                        data: b,
                        shape: rhs.shape.clone(),
                    },
                    transpose_lhs: ta,
                    transpose_rhs: tb,
                },
            );
        }
        Ok(out)
    }

    fn dot(&self, rhs: &Tensor) -> Result<Tensor> {
        if self.numel() != rhs.numel() {
            return Err(TangramError::ShapeMismatch {
                expected: self.shape.0.clone(),
                got: rhs.shape.0.clone(),
            });
        }
        let a = self.to_vec_f32()?;
        let b = rhs.to_vec_f32()?;
        let out = self
            .engine
            .create_f32(vec![kernels::dot(&a, &b)], Shape::scalar())?;
        if self.engine.is_recording() {
            self.record(
                &[self.id, rhs.id],
                out.id(),
                OpRecord::Dot {
                    lhs: Saved {
                        data: a,
                        shape: self.shape.clone(),
                    },
                    rhs: Saved {
                        data: b,
                        shape: rhs.shape.clone(),
                    },
                },
            );
        }
        Ok(out)
    }

    // ── Reductions ──────────────────────────────────────────────────────

    /// Sum reduction.
    ///
    /// `axis = None` flattens and reduces everything to `[1]` (and rejects
    /// `keepdims`). With an axis and `keepdims = false` the result drops
    /// *all* size-1 axes, not just the reduced one — long-standing engine
    /// behavior, kept deliberately and pinned by tests.
    pub fn sum(&self, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceMode::Sum, axis, keepdims)
    }

    /// Mean reduction (f32 only). Same axis/keepdims rules as [`Tensor::sum`].
    pub fn mean(&self, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        self.require_f32("mean")?;
        self.reduce(ReduceMode::Mean, axis, keepdims)
    }

    /// Max reduction. Same axis/keepdims rules as [`Tensor::sum`].
    pub fn max(&self, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceMode::Max, axis, keepdims)
    }

    /// Min reduction. Same axis/keepdims rules as [`Tensor::sum`].
    pub fn min(&self, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceMode::Min, axis, keepdims)
    }

    fn reduce(&self, mode: ReduceMode, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        match axis {
            None => {
                if keepdims {
                    return Err(TangramError::InvalidArgument(
                        "keepdims requires an explicit axis".into(),
                    ));
                }
                let flat = self.flatten()?;
                flat.reduce_prim(mode, 0)
            }
            Some(ax) => {
                let ax = resolve_axis(ax, self.shape.ndim())?;
                let kept = self.reduce_prim(mode, ax)?;
                if keepdims {
                    Ok(kept)
                } else {
                    let target = squeeze_all_units(&kept.shape);
                    kept.copy_reshaped(target)
                }
            }
        }
    }

    /// Single-axis reduction keeping the axis as size 1.
    fn reduce_prim(&self, mode: ReduceMode, axis: usize) -> Result<Tensor> {
        let mut dims = self.shape.0.clone();
        dims[axis] = 1;
        let out_shape = Shape::new(dims);

        match self.dtype {
            DType::F32 => {
                let data = self.to_vec_f32()?;
                let reduced = kernels::reduce_axis_f32(&data, &self.shape, axis, mode);
                let out = self.engine.create_f32(reduced, out_shape)?;
                if self.engine.is_recording() {
                    self.record(
                        &[self.id],
                        out.id(),
                        OpRecord::Reduce {
                            mode,
                            axis,
                            input: Saved {
                                data,
                                shape: self.shape.clone(),
                            },
                        },
                    );
                }
                Ok(out)
            }
            DType::I32 => {
                if mode == ReduceMode::Mean {
                    return Err(self.unsupported("mean"));
                }
                let data = self.to_vec_i32()?;
                let reduced = kernels::reduce_axis_i32(&data, &self.shape, axis, mode);
                self.engine.create_i32(reduced, out_shape)
            }
            _ => Err(self.unsupported("reduce")),
        }
    }

    /// Index of the maximum along `axis`, always i32. Same axis/keepdims
    /// rules as [`Tensor::sum`]; never recorded on the tape.
    pub fn argmax(&self, axis: Option<i64>, keepdims: bool) -> Result<Tensor> {
        match axis {
            None => {
                if keepdims {
                    return Err(TangramError::InvalidArgument(
                        "keepdims requires an explicit axis".into(),
                    ));
                }
                let flat = self.flatten()?;
                flat.argmax_prim(0)
            }
            Some(ax) => {
                let ax = resolve_axis(ax, self.shape.ndim())?;
                let kept = self.argmax_prim(ax)?;
                if keepdims {
                    Ok(kept)
                } else {
                    let target = squeeze_all_units(&kept.shape);
                    kept.copy_reshaped(target)
                }
            }
        }
    }

    fn argmax_prim(&self, axis: usize) -> Result<Tensor> {
        let mut dims = self.shape.0.clone();
        dims[axis] = 1;
        let out_shape = Shape::new(dims);
        let indices = match self.dtype {
            DType::F32 => kernels::argmax_axis(&self.to_vec_f32()?, &self.shape, axis),
            DType::I32 => kernels::argmax_axis(&self.to_vec_i32()?, &self.shape, axis),
            _ => return Err(self.unsupported("argmax")),
        };
        self.engine.create_i32(indices, out_shape)
    }

    // ── Composites ──────────────────────────────────────────────────────

    /// Numerically stable `log(sum(exp(x)))` along `axis`.
    pub fn logsumexp(&self, axis: i64, keepdims: bool) -> Result<Tensor> {
        self.require_f32("logsumexp")?;
        let peak = self.max(Some(axis), true)?;
        let shifted = self.sub(&peak)?;
        let summed = shifted.exp()?.sum(Some(axis), keepdims)?;
        let logged = summed.log()?;
        let peak = if keepdims {
            peak
        } else {
            let target = squeeze_all_units(&peak.shape);
            peak.copy_reshaped(target)?
        };
        logged.add(&peak)
    }

    /// Softmax along `axis`, lowered to `exp(x - logsumexp(x))`.
    pub fn softmax(&self, axis: i64) -> Result<Tensor> {
        let lse = self.logsumexp(axis, true)?;
        self.sub(&lse)?.exp()
    }

    /// Gather one element per lane along `axis` using an i32 index tensor
    /// with one entry per lane. The picked axis stays as size 1 when
    /// `keepdims`, and is squeezed away otherwise.
    pub fn index_one_hot(&self, index: &Tensor, axis: i64, keepdims: bool) -> Result<Tensor> {
        self.require_f32("index_one_hot")?;
        if index.dtype != DType::I32 {
            return Err(TangramError::DTypeMismatch {
                expected: DType::I32,
                got: index.dtype,
            });
        }
        let ax = resolve_axis(axis, self.shape.ndim())?;
        let dim = self.shape.0[ax];
        if dim == 0 {
            return Err(TangramError::InvalidArgument(format!(
                "cannot gather along empty axis {axis} of {}",
                self.shape
            )));
        }
        let lanes = self.numel() / dim;
        if index.numel() != lanes {
            return Err(TangramError::InvalidArgument(format!(
                "index has {} entries but input {} has {} lanes along axis {}",
                index.numel(),
                self.shape,
                lanes,
                axis
            )));
        }
        let idx = index.to_vec_i32()?;
        if let Some(&bad) = idx.iter().find(|&&i| i < 0 || i as i64 >= dim) {
            return Err(TangramError::InvalidArgument(format!(
                "index value {bad} out of range for axis {axis} of size {dim}"
            )));
        }

        let data = self.to_vec_f32()?;
        let picked = kernels::index_one_hot(&data, &self.shape, ax, &idx);
        let mut dims = self.shape.0.clone();
        dims[ax] = 1;
        let out = self.engine.create_f32(picked, Shape::new(dims))?;
        if self.engine.is_recording() {
            self.record(
                &[self.id],
                out.id(),
                OpRecord::IndexOneHot {
                    index: idx,
                    axis: ax,
                    input_shape: self.shape.clone(),
                },
            );
        }
        if keepdims {
            Ok(out)
        } else {
            out.remove_axis(&[ax as i64])
        }
    }

    // ── Casting ─────────────────────────────────────────────────────────

    /// Cast to `dtype`. Casting to the current dtype returns a clone of
    /// the handle without copying. Never recorded on the tape.
    pub fn astype(&self, dtype: DType) -> Result<Tensor> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let values: Vec<f32> = match self.dtype {
            DType::F32 => self.to_vec_f32()?,
            DType::I32 => self.to_vec_i32()?.iter().map(|&v| v as f32).collect(),
            DType::I8 => self.to_bytes()?.iter().map(|&b| b as i8 as f32).collect(),
            DType::U8 => self.to_bytes()?.iter().map(|&b| b as f32).collect(),
        };
        match dtype {
            DType::F32 => self.engine.create_f32(values, self.shape.clone()),
            DType::I32 => self.engine.create_i32(
                values.iter().map(|&v| v as i32).collect(),
                self.shape.clone(),
            ),
            DType::I8 => self.engine.create_raw(
                values.iter().map(|&v| v as i8 as u8).collect(),
                self.shape.clone(),
                DType::I8,
            ),
            DType::U8 => self.engine.create_raw(
                values.iter().map(|&v| v as u8).collect(),
                self.shape.clone(),
                DType::U8,
            ),
        }
    }

    // ── Convolution & pooling ───────────────────────────────────────────

    /// NCHW convolution with zero padding: input `[n, c_in, h, w]`,
    /// weight `[c_out, c_in, kh, kw]`.
    pub fn conv2d(&self, weight: &Tensor, stride: usize, padding: usize) -> Result<Tensor> {
        self.require_f32("conv2d")?;
        weight.require_f32("conv2d")?;
        if self.shape.ndim() != 4 || weight.shape.ndim() != 4 {
            return Err(TangramError::InvalidArgument(format!(
                "conv2d expects rank-4 input and weight, got {} and {}",
                self.shape, weight.shape
            )));
        }
        if stride == 0 {
            return Err(TangramError::InvalidArgument("stride must be positive".into()));
        }
        if self.shape.0[1] != weight.shape.0[1] {
            return Err(TangramError::InvalidArgument(format!(
                "conv2d channel mismatch: input has {} channels, weight expects {}",
                self.shape.0[1], weight.shape.0[1]
            )));
        }
        let oh = window_out_dim(self.shape.0[2], weight.shape.0[2] as usize, padding, stride)?;
        let ow = window_out_dim(self.shape.0[3], weight.shape.0[3] as usize, padding, stride)?;
        let out_shape = Shape::new(vec![self.shape.0[0], weight.shape.0[0], oh, ow]);

        let input = self.to_vec_f32()?;
        let w = weight.to_vec_f32()?;
        let data = kernels::conv2d(&input, &self.shape, &w, &weight.shape, stride, padding);
        let out = self.engine.create_f32(data, out_shape)?;
        if self.engine.is_recording() {
            self.record(
                &[self.id, weight.id],
                out.id(),
                OpRecord::Conv2d {
                    input: Saved {
                        data: input,
                        shape: self.shape.clone(),
                    },
                    weight: Saved {
                        data: w,
                        shape: weight.shape.clone(),
                    },
                    stride,
                    padding,
                },
            );
        }
        Ok(out)
    }

    /// NCHW pooling with a square window; `stride` defaults to the kernel
    /// size.
    pub fn pool2d(
        &self,
        kernel: usize,
        stride: Option<usize>,
        padding: usize,
        mode: PoolMode,
    ) -> Result<Tensor> {
        self.require_f32("pool2d")?;
        if self.shape.ndim() != 4 {
            return Err(TangramError::InvalidArgument(format!(
                "pool2d expects rank-4 input, got {}",
                self.shape
            )));
        }
        if kernel == 0 {
            return Err(TangramError::InvalidArgument("kernel must be positive".into()));
        }
        let stride = stride.unwrap_or(kernel);
        let oh = window_out_dim(self.shape.0[2], kernel, padding, stride)?;
        let ow = window_out_dim(self.shape.0[3], kernel, padding, stride)?;
        let out_shape = Shape::new(vec![self.shape.0[0], self.shape.0[1], oh, ow]);

        let input = self.to_vec_f32()?;
        let data = kernels::pool2d(&input, &self.shape, kernel, stride, padding, mode);
        let out = self.engine.create_f32(data, out_shape)?;
        if self.engine.is_recording() {
            self.record(
                &[self.id],
                out.id(),
                OpRecord::Pool2d {
                    input: Saved {
                        data: input,
                        shape: self.shape.clone(),
                    },
                    kernel,
                    stride,
                    padding,
                    mode,
                },
            );
        }
        Ok(out)
    }
}

/// Dims of `op(X)` given stored dims and a transpose flag.
fn logical_mat_dims(dims: &[i64], transposed: bool) -> (i64, i64) {
    if transposed {
        (dims[1], dims[0])
    } else {
        (dims[0], dims[1])
    }
}

impl std::ops::Add for &Tensor {
    type Output = Result<Tensor>;
    fn add(self, rhs: &Tensor) -> Self::Output {
        Tensor::add(self, rhs)
    }
}

impl std::ops::Sub for &Tensor {
    type Output = Result<Tensor>;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        Tensor::sub(self, rhs)
    }
}

impl std::ops::Mul for &Tensor {
    type Output = Result<Tensor>;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        Tensor::mul(self, rhs)
    }
}

impl std::ops::Neg for &Tensor {
    type Output = Result<Tensor>;
    fn neg(self) -> Self::Output {
        Tensor::neg(self)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<Engine> {
        Engine::new()
    }

    fn t(e: &Arc<Engine>, data: &[f32], dims: &[i64]) -> Tensor {
        e.tensor(data, dims).unwrap()
    }

    #[test]
    fn test_add() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0], &[3]);
        let b = t(&e, &[4.0, 5.0, 6.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.to_vec_f32().unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_add_broadcast() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&e, &[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(
            c.to_vec_f32().unwrap(),
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_add_incompatible_shapes() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        let b = t(&e, &[1.0, 2.0, 3.0], &[3]);
        assert!(matches!(
            a.add(&b),
            Err(TangramError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dtype_mismatch() {
        let e = engine();
        let a = t(&e, &[1.0], &[1]);
        let b = e.tensor_i32(&[1], &[1]).unwrap();
        assert!(matches!(a.add(&b), Err(TangramError::DTypeMismatch { .. })));
    }

    #[test]
    fn test_div_requires_f32() {
        let e = engine();
        let a = e.tensor_i32(&[4], &[1]).unwrap();
        let b = e.tensor_i32(&[2], &[1]).unwrap();
        assert!(a.div(&b).is_err());
    }

    #[test]
    fn test_i32_arithmetic() {
        let e = engine();
        let a = e.tensor_i32(&[1, 2, 3], &[3]).unwrap();
        let b = e.tensor_i32(&[10, 20, 30], &[3]).unwrap();
        assert_eq!(a.add(&b).unwrap().to_vec_i32().unwrap(), vec![11, 22, 33]);
        assert_eq!(a.mul(&b).unwrap().to_vec_i32().unwrap(), vec![10, 40, 90]);
    }

    #[test]
    fn test_eq_mask() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0], &[3]);
        let b = t(&e, &[1.0, 0.0, 3.0], &[3]);
        assert_eq!(a.eq(&b).unwrap().to_vec_f32().unwrap(), vec![1.0, 0.0, 1.0]);

        let ai = e.tensor_i32(&[1, 2], &[2]).unwrap();
        let bi = e.tensor_i32(&[1, 3], &[2]).unwrap();
        assert_eq!(ai.eq(&bi).unwrap().to_vec_i32().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_scalar_ops() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        assert_eq!(a.add_scalar(1.0).unwrap().to_vec_f32().unwrap(), vec![2.0, 3.0]);
        assert_eq!(a.mul_scalar(3.0).unwrap().to_vec_f32().unwrap(), vec![3.0, 6.0]);
        assert_eq!(a.div_scalar(2.0).unwrap().to_vec_f32().unwrap(), vec![0.5, 1.0]);
    }

    #[test]
    fn test_inplace_updates_storage() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        let g = t(&e, &[0.5, 0.5], &[2]);
        a.sub_(&g).unwrap();
        assert_eq!(a.to_vec_f32().unwrap(), vec![0.5, 1.5]);
        a.add_(&g).unwrap();
        assert_eq!(a.to_vec_f32().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_inplace_requires_exact_shape() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        let b = t(&e, &[1.0], &[1]);
        assert!(a.add_(&b).is_err());
    }

    #[test]
    fn test_unary() {
        let e = engine();
        let a = t(&e, &[0.0, 1.0, -2.0], &[3]);
        assert_eq!(a.neg().unwrap().to_vec_f32().unwrap(), vec![0.0, -1.0, 2.0]);
        assert_eq!(a.relu().unwrap().to_vec_f32().unwrap(), vec![0.0, 1.0, 0.0]);
        let ex = a.exp().unwrap().to_vec_f32().unwrap();
        assert!((ex[1] - std::f32::consts::E).abs() < 1e-6);
        assert_eq!(
            a.square().unwrap().to_vec_f32().unwrap(),
            vec![0.0, 1.0, 4.0]
        );
    }

    #[test]
    fn test_sigmoid() {
        let e = engine();
        let a = t(&e, &[0.0, 4.0, -4.0], &[3]);
        let s = a.sigmoid().unwrap().to_vec_f32().unwrap();
        assert!((s[0] - 0.5).abs() < 1e-6);
        assert!((s[1] - 0.982_013_8).abs() < 1e-6);
        // sigmoid(-x) = 1 - sigmoid(x)
        assert!((s[1] + s[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reshape_roundtrip() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = a.reshape(&[3, 2]).unwrap();
        assert_eq!(b.shape(), &Shape::new(vec![3, 2]));
        let c = b.reshape(&[-1]).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![6]));
        assert_eq!(c.to_vec_f32().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_axis_roundtrip() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = a.add_axis(&[0, -1]).unwrap();
        assert_eq!(b.shape(), &Shape::new(vec![1, 2, 2, 1]));
        let c = b.remove_axis(&[0, -1]).unwrap();
        assert_eq!(c.shape(), a.shape());
        assert_eq!(c.to_vec_f32().unwrap(), a.to_vec_f32().unwrap());
    }

    #[test]
    fn test_transpose() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = a.transpose(None).unwrap();
        assert_eq!(b.shape(), &Shape::new(vec![3, 2]));
        assert_eq!(b.to_vec_f32().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(a.transpose(Some(&[0, 0])).is_err());
    }

    #[test]
    fn test_broadcast_to_identity() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        let b = a.broadcast_to(&Shape::new(vec![2])).unwrap();
        assert_eq!(b.to_vec_f32().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_matmul_2d() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&e, &[5.0, 6.0, 7.0, 8.0], &[2, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_vec_f32().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_vector_times_matrix() {
        // [4,3,2,1] @ [[1],[2],[3],[4]] = 4 + 6 + 6 + 4 = 20
        let e = engine();
        let a = t(&e, &[4.0, 3.0, 2.0, 1.0], &[4]);
        let b = t(&e, &[1.0, 2.0, 3.0, 4.0], &[4, 1]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![1]));
        assert_eq!(c.to_vec_f32().unwrap(), vec![20.0]);
    }

    #[test]
    fn test_matmul_dot() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0], &[3]);
        let b = t(&e, &[4.0, 5.0, 6.0], &[3]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![1]));
        assert_eq!(c.to_vec_f32().unwrap(), vec![32.0]);
    }

    #[test]
    fn test_matmul_matrix_times_vector() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&e, &[1.0, 1.0], &[2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![2]));
        assert_eq!(c.to_vec_f32().unwrap(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_matmul_batched_broadcast() {
        // [2,2,2] @ [2,2]: rhs batch dim broadcast up.
        let e = engine();
        let a = t(&e, &[1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0], &[2, 2, 2]);
        let b = t(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![2, 2, 2]));
        assert_eq!(
            c.to_vec_f32().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn test_matmul_rank4_flattens() {
        let e = engine();
        let a = e.ones(&[2, 2, 2, 3], DType::F32).unwrap();
        let b = e.ones(&[2, 2, 3, 2], DType::F32).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &Shape::new(vec![2, 2, 2, 2]));
        assert_eq!(c.to_vec_f32().unwrap(), vec![3.0; 16]);
    }

    #[test]
    fn test_matmul_errors() {
        let e = engine();
        let a = e.ones(&[2, 3], DType::F32).unwrap();
        let b = e.ones(&[4, 2], DType::F32).unwrap();
        let err = a.matmul(&b).unwrap_err().to_string();
        assert!(err.contains("inner dimension"), "got: {err}");

        let a = e.ones(&[2, 2, 3], DType::F32).unwrap();
        let b = e.ones(&[3, 3, 2], DType::F32).unwrap();
        let err = a.matmul(&b).unwrap_err().to_string();
        assert!(err.contains("batch dimension"), "got: {err}");
    }

    #[test]
    fn test_matmul_transpose_flags() {
        let e = engine();
        // op(A) = [[1,2],[3,4]] stored transposed.
        let a = t(&e, &[1.0, 3.0, 2.0, 4.0], &[2, 2]);
        let b = t(&e, &[5.0, 6.0, 7.0, 8.0], &[2, 2]);
        let c = a.matmul_t(&b, true, false).unwrap();
        assert_eq!(c.to_vec_f32().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_sum_axis_none() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = a.sum(None, false).unwrap();
        assert_eq!(s.shape(), &Shape::new(vec![1]));
        assert_eq!(s.to_vec_f32().unwrap(), vec![10.0]);
        assert!(a.sum(None, true).is_err());
    }

    #[test]
    fn test_sum_axis_keepdims() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = a.sum(Some(1), true).unwrap();
        assert_eq!(s.shape(), &Shape::new(vec![2, 1]));
        assert_eq!(s.to_vec_f32().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_reduce_drops_all_unit_axes() {
        // [1,3,1] summed over axis 1 with keepdims=false collapses to [1],
        // not [1,1]: every unit axis goes, not just the reduced one.
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0], &[1, 3, 1]);
        let s = a.sum(Some(1), false).unwrap();
        assert_eq!(s.shape(), &Shape::new(vec![1]));
        assert_eq!(s.to_vec_f32().unwrap(), vec![6.0]);
    }

    #[test]
    fn test_mean_max_min() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(
            a.mean(Some(1), false).unwrap().to_vec_f32().unwrap(),
            vec![2.0, 5.0]
        );
        assert_eq!(
            a.max(Some(0), false).unwrap().to_vec_f32().unwrap(),
            vec![4.0, 5.0, 6.0]
        );
        assert_eq!(
            a.min(None, false).unwrap().to_vec_f32().unwrap(),
            vec![1.0]
        );
    }

    #[test]
    fn test_i32_reductions() {
        let e = engine();
        let a = e.tensor_i32(&[1, 5, 3], &[3]).unwrap();
        assert_eq!(a.sum(None, false).unwrap().to_vec_i32().unwrap(), vec![9]);
        assert_eq!(a.max(None, false).unwrap().to_vec_i32().unwrap(), vec![5]);
        assert!(a.mean(None, false).is_err());
    }

    #[test]
    fn test_argmax() {
        let e = engine();
        let a = t(
            &e,
            &[9.0, 1.0, 0.0, 3.0, 0.0, 8.0, 2.0, 1.0, 1.0, 2.0, 3.0, 4.0],
            &[3, 4],
        );
        let idx = a.argmax(Some(1), false).unwrap();
        assert_eq!(idx.dtype(), DType::I32);
        assert_eq!(idx.shape(), &Shape::new(vec![3]));
        assert_eq!(idx.to_vec_i32().unwrap(), vec![0, 1, 3]);
    }

    #[test]
    fn test_argmax_flat() {
        let e = engine();
        let a = t(&e, &[1.0, 9.0, 3.0, 4.0], &[2, 2]);
        let idx = a.argmax(None, false).unwrap();
        assert_eq!(idx.to_vec_i32().unwrap(), vec![1]);
    }

    #[test]
    fn test_logsumexp_matches_naive() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3]);
        let lse = a.logsumexp(1, false).unwrap().to_vec_f32().unwrap();
        for (row, &got) in [[1.0f32, 2.0, 3.0], [-1.0, 0.0, 1.0]]
            .iter()
            .zip(lse.iter())
        {
            let naive = row.iter().map(|v| v.exp()).sum::<f32>().ln();
            assert!((got - naive).abs() < 1e-5, "got {got}, naive {naive}");
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3]);
        let s = a.softmax(1).unwrap().to_vec_f32().unwrap();
        let row0: f32 = s[0..3].iter().sum();
        let row1: f32 = s[3..6].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!(s[0] < s[1] && s[1] < s[2]);
    }

    #[test]
    fn test_index_one_hot() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let idx = e.tensor_i32(&[2, 0], &[2]).unwrap();
        let picked = a.index_one_hot(&idx, 1, true).unwrap();
        assert_eq!(picked.shape(), &Shape::new(vec![2, 1]));
        assert_eq!(picked.to_vec_f32().unwrap(), vec![3.0, 4.0]);

        let squeezed = a.index_one_hot(&idx, 1, false).unwrap();
        assert_eq!(squeezed.shape(), &Shape::new(vec![2]));

        let bad = e.tensor_i32(&[3, 0], &[2]).unwrap();
        assert!(a.index_one_hot(&bad, 1, true).is_err());
    }

    #[test]
    fn test_index_one_hot_empty_axis_is_error() {
        // A zero-size gather axis has no elements to pick.
        let e = engine();
        let a = t(&e, &[], &[2, 0]);
        let idx = e.tensor_i32(&[0, 0], &[2]).unwrap();
        assert!(matches!(
            a.index_one_hot(&idx, 1, true),
            Err(TangramError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_astype_same_dtype_shares_storage() {
        let e = engine();
        let a = t(&e, &[1.0], &[1]);
        let b = a.astype(DType::F32).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_astype_converts() {
        let e = engine();
        let a = t(&e, &[1.9, -2.9], &[2]);
        let b = a.astype(DType::I32).unwrap();
        assert_eq!(b.to_vec_i32().unwrap(), vec![1, -2]);
        let c = b.astype(DType::F32).unwrap();
        assert_eq!(c.to_vec_f32().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_conv2d_smoke() {
        let e = engine();
        let input = t(&e, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let weight = t(&e, &[1.0, 1.0, 1.0, 1.0], &[1, 1, 2, 2]);
        let out = input.conv2d(&weight, 1, 0).unwrap();
        assert_eq!(out.shape(), &Shape::new(vec![1, 1, 1, 1]));
        assert_eq!(out.to_vec_f32().unwrap(), vec![10.0]);
    }

    #[test]
    fn test_pool2d_smoke() {
        let e = engine();
        let input = t(&e, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let out = input.pool2d(2, None, 0, PoolMode::Max).unwrap();
        assert_eq!(out.to_vec_f32().unwrap(), vec![4.0]);
        let avg = input.pool2d(2, None, 0, PoolMode::Avg).unwrap();
        assert_eq!(avg.to_vec_f32().unwrap(), vec![2.5]);
    }

    #[test]
    fn test_operator_sugar() {
        let e = engine();
        let a = t(&e, &[1.0, 2.0], &[2]);
        let b = t(&e, &[3.0, 4.0], &[2]);
        assert_eq!((&a + &b).unwrap().to_vec_f32().unwrap(), vec![4.0, 6.0]);
        assert_eq!((&a * &b).unwrap().to_vec_f32().unwrap(), vec![3.0, 8.0]);
        assert_eq!((-&a).unwrap().to_vec_f32().unwrap(), vec![-1.0, -2.0]);
    }
}
