//! VJP (Vector-Jacobian Product) rules for each recorded op.
//!
//! Every rule reads only the payload saved on the tape node, never the
//! arena: the forward tensors may already be freed by the time backward
//! runs. Saved buffers are revived as fresh tensors inside the backward
//! scope, so they are reclaimed with everything else when it closes.

use std::sync::Arc;

use tangram_core::kernels;
use tangram_core::tape::{OpRecord, ReduceMode, Saved};
use tangram_core::{Engine, Result, Tensor};

fn revive(engine: &Arc<Engine>, saved: &Saved) -> Result<Tensor> {
    engine.tensor(&saved.data, &saved.shape.0)
}

/// Gradients for each input of a recorded op, in input order.
pub fn vjp(record: &OpRecord, engine: &Arc<Engine>, grad_output: &Tensor) -> Result<Vec<Tensor>> {
    match record {
        // ── Elementwise ──────────────────────────────────────────────
        OpRecord::Add => {
            // d(a+b)/da = 1, d(a+b)/db = 1
            Ok(vec![grad_output.clone(), grad_output.clone()])
        }

        OpRecord::Sub => {
            // d(a-b)/da = 1, d(a-b)/db = -1
            Ok(vec![grad_output.clone(), grad_output.neg()?])
        }

        OpRecord::Mul { lhs, rhs } => {
            // d(a*b)/da = b, d(a*b)/db = a
            let a = revive(engine, lhs)?;
            let b = revive(engine, rhs)?;
            Ok(vec![grad_output.mul(&b)?, grad_output.mul(&a)?])
        }

        OpRecord::Div { lhs, rhs } => {
            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
            let a = revive(engine, lhs)?;
            let b = revive(engine, rhs)?;
            let grad_a = grad_output.div(&b)?;
            let b_sq = b.mul(&b)?;
            let grad_b = grad_output.mul(&a.neg()?)?.div(&b_sq)?;
            Ok(vec![grad_a, grad_b])
        }

        OpRecord::Neg => Ok(vec![grad_output.neg()?]),

        OpRecord::Sin { input } => {
            let x = revive(engine, input)?;
            Ok(vec![grad_output.mul(&x.cos()?)?])
        }

        OpRecord::Cos { input } => {
            let x = revive(engine, input)?;
            Ok(vec![grad_output.mul(&x.sin()?.neg()?)?])
        }

        OpRecord::Exp { input } => {
            let x = revive(engine, input)?;
            Ok(vec![grad_output.mul(&x.exp()?)?])
        }

        OpRecord::Log { input } => {
            let x = revive(engine, input)?;
            Ok(vec![grad_output.div(&x)?])
        }

        OpRecord::Relu { input } => {
            // Mask of where the input was strictly positive.
            let mask: Vec<f32> = input
                .data
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
                .collect();
            let mask = engine.tensor(&mask, &input.shape.0)?;
            Ok(vec![grad_output.mul(&mask)?])
        }

        // ── Linear algebra ───────────────────────────────────────────
        OpRecord::Matmul {
            lhs,
            rhs,
            transpose_lhs,
            transpose_rhs,
        }
        | OpRecord::BatchMatmul {
            lhs,
            rhs,
            transpose_lhs,
            transpose_rhs,
        } => {
            // C = op(A) @ op(B)
            // For untransposed operands: dA = dC @ op(B)^T, dB = op(A)^T @ dC.
            // A transposed operand takes the transposed gradient instead.
            let a = revive(engine, lhs)?;
            let b = revive(engine, rhs)?;
            let (ta, tb) = (*transpose_lhs, *transpose_rhs);
            let grad_a = if ta {
                b.matmul_t(grad_output, tb, true)?
            } else {
                grad_output.matmul_t(&b, false, !tb)?
            };
            let grad_b = if tb {
                grad_output.matmul_t(&a, true, ta)?
            } else {
                a.matmul_t(grad_output, !ta, false)?
            };
            Ok(vec![grad_a, grad_b])
        }

        OpRecord::Dot { lhs, rhs } => {
            // Scalar-shaped grad scales each operand's partner.
            let a = revive(engine, lhs)?;
            let b = revive(engine, rhs)?;
            Ok(vec![b.mul(grad_output)?, a.mul(grad_output)?])
        }

        // ── Shape ops (rearrange the grad) ───────────────────────────
        OpRecord::Reshape { input_shape } => Ok(vec![grad_output.reshape(&input_shape.0)?]),

        OpRecord::Transpose { perm } => {
            let mut inv_perm = vec![0usize; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                inv_perm[p] = i;
            }
            Ok(vec![grad_output.transpose(Some(&inv_perm))?])
        }

        OpRecord::BroadcastTo { input_shape } => {
            // Fold stretched dimensions back by summation.
            let data = grad_output.to_vec_f32()?;
            let reduced = kernels::reduce_broadcast(&data, grad_output.shape(), input_shape);
            Ok(vec![engine.tensor(&reduced, &input_shape.0)?])
        }

        // ── Reductions ───────────────────────────────────────────────
        OpRecord::Reduce { mode, axis, input } => {
            // The primitive keeps the reduced axis as size 1, so the grad
            // broadcasts straight back to the input shape.
            let spread = grad_output.broadcast_to(&input.shape)?;
            let grad = match mode {
                ReduceMode::Sum => spread,
                ReduceMode::Mean => {
                    let dim = input.shape.0[*axis] as f32;
                    spread.div_scalar(dim)?
                }
                ReduceMode::Max | ReduceMode::Min => {
                    // Route to the first extreme element of each lane.
                    let mask = kernels::reduce_arg_mask(&input.data, &input.shape, *axis, *mode);
                    let mask = engine.tensor(&mask, &input.shape.0)?;
                    spread.mul(&mask)?
                }
            };
            Ok(vec![grad])
        }

        OpRecord::IndexOneHot {
            index,
            axis,
            input_shape,
        } => {
            let grad = grad_output.to_vec_f32()?;
            let scattered = kernels::index_one_hot_scatter(&grad, input_shape, *axis, index);
            Ok(vec![engine.tensor(&scattered, &input_shape.0)?])
        }

        // ── Convolution & pooling ────────────────────────────────────
        OpRecord::Conv2d {
            input,
            weight,
            stride,
            padding,
        } => {
            let grad = grad_output.to_vec_f32()?;
            let grad_input = kernels::conv2d_grad_input(
                &grad,
                &weight.data,
                &input.shape,
                &weight.shape,
                *stride,
                *padding,
            );
            let grad_weight = kernels::conv2d_grad_weight(
                &grad,
                &input.data,
                &input.shape,
                &weight.shape,
                *stride,
                *padding,
            );
            Ok(vec![
                engine.tensor(&grad_input, &input.shape.0)?,
                engine.tensor(&grad_weight, &weight.shape.0)?,
            ])
        }

        OpRecord::Pool2d {
            input,
            kernel,
            stride,
            padding,
            mode,
        } => {
            let grad = grad_output.to_vec_f32()?;
            let grad_input = kernels::pool2d_grad(
                &input.data,
                &grad,
                &input.shape,
                *kernel,
                *stride,
                *padding,
                *mode,
            );
            Ok(vec![engine.tensor(&grad_input, &input.shape.0)?])
        }
    }
}
