//! Built-in CPU kernels — correctness oracle.
//!
//! Intentionally simple, safe Rust implementations of every primitive op.
//! They prioritize correctness and readability over performance. The
//! dispatcher in `tensor.rs` validates shapes and dtypes before calling in,
//! so kernels assume well-formed inputs; backward kernels live here too so
//! `tangram-autograd` can compose them.

use crate::tape::ReduceMode;
use crate::types::{PoolMode, Shape};

// ── Elementwise ──────────────────────────────────────────────────────────

pub fn map_unary<T: Copy, U>(a: &[T], f: impl Fn(T) -> U) -> Vec<U> {
    a.iter().map(|&x| f(x)).collect()
}

pub fn zip_binary<T: Copy, U>(a: &[T], b: &[T], f: impl Fn(T, T) -> U) -> Vec<U> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
}

// ── Broadcasting ─────────────────────────────────────────────────────────

/// Materialize `data` (of `in_shape`) at `out_shape`, stretching size-1
/// dimensions. Dimensions are compared from the right.
pub fn broadcast<T: Copy + Default>(data: &[T], in_shape: &Shape, out_shape: &Shape) -> Vec<T> {
    let in_dims = &in_shape.0;
    let out_dims = &out_shape.0;
    let out_ndim = out_dims.len();
    let in_ndim = in_dims.len();
    let pad = out_ndim - in_ndim;
    let total = out_shape.numel() as usize;

    let mut result = vec![T::default(); total];
    for (out_flat, out) in result.iter_mut().enumerate() {
        let mut remaining = out_flat;
        let mut in_flat = 0usize;
        let mut in_stride = 1usize;

        for d in (0..out_ndim).rev() {
            let out_dim = out_dims[d] as usize;
            let coord = remaining % out_dim;
            remaining /= out_dim;

            if d >= pad {
                let in_d = d - pad;
                let in_dim = in_dims[in_d] as usize;
                let in_coord = if in_dim == 1 { 0 } else { coord };
                in_flat += in_coord * in_stride;
                in_stride *= in_dim;
            }
        }
        *out = data[in_flat];
    }
    result
}

/// Backward of `broadcast`: fold `grad` (of `from` shape) back onto
/// `to` by summing every output element into the input position it was
/// stretched from.
pub fn reduce_broadcast(grad: &[f32], from: &Shape, to: &Shape) -> Vec<f32> {
    let from_dims = &from.0;
    let to_dims = &to.0;
    let from_ndim = from_dims.len();
    let pad = from_ndim - to_dims.len();

    let mut result = vec![0.0f32; to.numel() as usize];
    for (out_flat, &g) in grad.iter().enumerate() {
        let mut remaining = out_flat;
        let mut in_flat = 0usize;
        let mut in_stride = 1usize;

        for d in (0..from_ndim).rev() {
            let out_dim = from_dims[d] as usize;
            let coord = remaining % out_dim;
            remaining /= out_dim;

            if d >= pad {
                let in_d = d - pad;
                let in_dim = to_dims[in_d] as usize;
                let in_coord = if in_dim == 1 { 0 } else { coord };
                in_flat += in_coord * in_stride;
                in_stride *= in_dim;
            }
        }
        result[in_flat] += g;
    }
    result
}

// ── Transpose ────────────────────────────────────────────────────────────

pub fn transpose<T: Copy + Default>(data: &[T], shape: &Shape, perm: &[usize]) -> Vec<T> {
    let ndim = shape.ndim();
    let old_shape: Vec<usize> = shape.0.iter().map(|&d| d as usize).collect();
    let new_shape: Vec<usize> = perm.iter().map(|&ax| old_shape[ax]).collect();
    let old_strides = shape.strides();

    let mut result = vec![T::default(); data.len()];
    for (flat, out) in result.iter_mut().enumerate() {
        // Convert flat index in the new layout to a flat index in the old.
        let mut remaining = flat;
        let mut old_flat = 0;
        for dim_idx in 0..ndim {
            let inner: usize = new_shape[dim_idx + 1..].iter().product::<usize>().max(1);
            let coord = remaining / inner;
            remaining %= inner;
            old_flat += coord * old_strides[perm[dim_idx]];
        }
        *out = data[old_flat];
    }
    result
}

// ── Matmul family ────────────────────────────────────────────────────────

/// `C[m,n] = op(A) @ op(B)` for a single 2-D pair.
///
/// `a` is stored as `[m,k]` (or `[k,m]` when `ta`), `b` as `[k,n]` (or
/// `[n,k]` when `tb`).
pub fn matmul_2d(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    ta: bool,
    tb: bool,
) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                let av = if ta { a[p * m + i] } else { a[i * k + p] };
                let bv = if tb { b[j * k + p] } else { b[p * n + j] };
                sum += av * bv;
            }
            out[i * n + j] = sum;
        }
    }
    out
}

/// Batched matmul over rank-3 operands with matching batch extents.
pub fn batch_matmul(
    a: &[f32],
    b: &[f32],
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    ta: bool,
    tb: bool,
) -> Vec<f32> {
    let a_stride = m * k;
    let b_stride = k * n;
    let mut out = Vec::with_capacity(batch * m * n);
    for bi in 0..batch {
        out.extend(matmul_2d(
            &a[bi * a_stride..(bi + 1) * a_stride],
            &b[bi * b_stride..(bi + 1) * b_stride],
            m,
            k,
            n,
            ta,
            tb,
        ));
    }
    out
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ── Reductions ───────────────────────────────────────────────────────────

fn axis_split(shape: &Shape, axis: usize) -> (usize, usize, usize) {
    let outer: usize = shape.0[..axis].iter().product::<i64>() as usize;
    let dim: usize = shape.0[axis] as usize;
    let inner: usize = shape.0[axis + 1..].iter().product::<i64>() as usize;
    (outer, dim, inner)
}

/// Reduce one axis of an f32 tensor, keeping the axis as size 1.
pub fn reduce_axis_f32(data: &[f32], shape: &Shape, axis: usize, mode: ReduceMode) -> Vec<f32> {
    let (outer, dim, inner) = axis_split(shape, axis);
    let mut result = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let lane = (0..dim).map(|d| data[o * dim * inner + d * inner + i]);
            let v = match mode {
                ReduceMode::Sum => lane.sum(),
                ReduceMode::Mean => lane.sum::<f32>() / dim as f32,
                ReduceMode::Max => lane.fold(f32::NEG_INFINITY, f32::max),
                ReduceMode::Min => lane.fold(f32::INFINITY, f32::min),
            };
            result.push(v);
        }
    }
    result
}

/// Reduce one axis of an i32 tensor (Mean is rejected by the dispatcher).
pub fn reduce_axis_i32(data: &[i32], shape: &Shape, axis: usize, mode: ReduceMode) -> Vec<i32> {
    let (outer, dim, inner) = axis_split(shape, axis);
    let mut result = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let lane = (0..dim).map(|d| data[o * dim * inner + d * inner + i]);
            let v = match mode {
                ReduceMode::Sum => lane.sum(),
                ReduceMode::Max => lane.max().unwrap_or(0),
                ReduceMode::Min => lane.min().unwrap_or(0),
                ReduceMode::Mean => unreachable!("mean is f32-only"),
            };
            result.push(v);
        }
    }
    result
}

/// Index of the first maximum along `axis`, with the axis kept as size 1.
pub fn argmax_axis<T: Copy + PartialOrd>(data: &[T], shape: &Shape, axis: usize) -> Vec<i32> {
    let (outer, dim, inner) = axis_split(shape, axis);
    let mut result = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            for d in 1..dim {
                if data[o * dim * inner + d * inner + i] > data[o * dim * inner + best * inner + i]
                {
                    best = d;
                }
            }
            result.push(best as i32);
        }
    }
    result
}

/// 0/1 mask marking, per lane, the first element equal to the lane's
/// extreme. Backward of max/min routes the gradient through this mask.
pub fn reduce_arg_mask(data: &[f32], shape: &Shape, axis: usize, mode: ReduceMode) -> Vec<f32> {
    let (outer, dim, inner) = axis_split(shape, axis);
    let mut mask = vec![0.0f32; data.len()];
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            for d in 1..dim {
                let cur = data[o * dim * inner + d * inner + i];
                let best_val = data[o * dim * inner + best * inner + i];
                let better = match mode {
                    ReduceMode::Max => cur > best_val,
                    ReduceMode::Min => cur < best_val,
                    _ => false,
                };
                if better {
                    best = d;
                }
            }
            mask[o * dim * inner + best * inner + i] = 1.0;
        }
    }
    mask
}

// ── Gather / scatter ─────────────────────────────────────────────────────

/// Pick one element per lane along `axis`; the picked axis stays size 1.
pub fn index_one_hot(data: &[f32], shape: &Shape, axis: usize, index: &[i32]) -> Vec<f32> {
    let (outer, dim, inner) = axis_split(shape, axis);
    let mut result = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let idx = index[o * inner + i] as usize;
            let idx = idx.min(dim - 1);
            result.push(data[o * dim * inner + idx * inner + i]);
        }
    }
    result
}

/// Backward of `index_one_hot`: scatter each lane's gradient back to the
/// position it was gathered from.
pub fn index_one_hot_scatter(
    grad: &[f32],
    input_shape: &Shape,
    axis: usize,
    index: &[i32],
) -> Vec<f32> {
    let (outer, dim, inner) = axis_split(input_shape, axis);
    let mut result = vec![0.0f32; input_shape.numel() as usize];
    for o in 0..outer {
        for i in 0..inner {
            let idx = (index[o * inner + i] as usize).min(dim - 1);
            result[o * dim * inner + idx * inner + i] += grad[o * inner + i];
        }
    }
    result
}

// ── Convolution ──────────────────────────────────────────────────────────

/// Direct NCHW convolution with zero padding.
///
/// `in_shape = [n, c_in, h, w]`, `w_shape = [c_out, c_in, kh, kw]`.
pub fn conv2d(
    input: &[f32],
    in_shape: &Shape,
    weight: &[f32],
    w_shape: &Shape,
    stride: usize,
    padding: usize,
) -> Vec<f32> {
    let (n, c_in, h, w) = nchw(in_shape);
    let (c_out, _, kh, kw) = nchw(w_shape);
    let oh = out_extent(h, kh, padding, stride);
    let ow = out_extent(w, kw, padding, stride);

    let mut out = vec![0.0f32; n * c_out * oh * ow];
    for ni in 0..n {
        for oc in 0..c_out {
            for y in 0..oh {
                for x in 0..ow {
                    let mut sum = 0.0f32;
                    for ic in 0..c_in {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = y * stride + ky;
                                let ix = x * stride + kx;
                                if iy < padding || ix < padding {
                                    continue;
                                }
                                let (iy, ix) = (iy - padding, ix - padding);
                                if iy >= h || ix >= w {
                                    continue;
                                }
                                sum += input[((ni * c_in + ic) * h + iy) * w + ix]
                                    * weight[((oc * c_in + ic) * kh + ky) * kw + kx];
                            }
                        }
                    }
                    out[((ni * c_out + oc) * oh + y) * ow + x] = sum;
                }
            }
        }
    }
    out
}

/// Gradient of `conv2d` with respect to the input.
pub fn conv2d_grad_input(
    grad: &[f32],
    weight: &[f32],
    in_shape: &Shape,
    w_shape: &Shape,
    stride: usize,
    padding: usize,
) -> Vec<f32> {
    let (n, c_in, h, w) = nchw(in_shape);
    let (c_out, _, kh, kw) = nchw(w_shape);
    let oh = out_extent(h, kh, padding, stride);
    let ow = out_extent(w, kw, padding, stride);

    let mut out = vec![0.0f32; n * c_in * h * w];
    for ni in 0..n {
        for oc in 0..c_out {
            for y in 0..oh {
                for x in 0..ow {
                    let g = grad[((ni * c_out + oc) * oh + y) * ow + x];
                    for ic in 0..c_in {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = y * stride + ky;
                                let ix = x * stride + kx;
                                if iy < padding || ix < padding {
                                    continue;
                                }
                                let (iy, ix) = (iy - padding, ix - padding);
                                if iy >= h || ix >= w {
                                    continue;
                                }
                                out[((ni * c_in + ic) * h + iy) * w + ix] +=
                                    g * weight[((oc * c_in + ic) * kh + ky) * kw + kx];
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

/// Gradient of `conv2d` with respect to the weight.
pub fn conv2d_grad_weight(
    grad: &[f32],
    input: &[f32],
    in_shape: &Shape,
    w_shape: &Shape,
    stride: usize,
    padding: usize,
) -> Vec<f32> {
    let (n, c_in, h, w) = nchw(in_shape);
    let (c_out, _, kh, kw) = nchw(w_shape);
    let oh = out_extent(h, kh, padding, stride);
    let ow = out_extent(w, kw, padding, stride);

    let mut out = vec![0.0f32; c_out * c_in * kh * kw];
    for ni in 0..n {
        for oc in 0..c_out {
            for y in 0..oh {
                for x in 0..ow {
                    let g = grad[((ni * c_out + oc) * oh + y) * ow + x];
                    for ic in 0..c_in {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = y * stride + ky;
                                let ix = x * stride + kx;
                                if iy < padding || ix < padding {
                                    continue;
                                }
                                let (iy, ix) = (iy - padding, ix - padding);
                                if iy >= h || ix >= w {
                                    continue;
                                }
                                out[((oc * c_in + ic) * kh + ky) * kw + kx] +=
                                    g * input[((ni * c_in + ic) * h + iy) * w + ix];
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

// ── Pooling ──────────────────────────────────────────────────────────────

/// NCHW pooling with a square window. Average pooling divides by the full
/// window area, padding included.
pub fn pool2d(
    input: &[f32],
    in_shape: &Shape,
    kernel: usize,
    stride: usize,
    padding: usize,
    mode: PoolMode,
) -> Vec<f32> {
    let (n, c, h, w) = nchw(in_shape);
    let oh = out_extent(h, kernel, padding, stride);
    let ow = out_extent(w, kernel, padding, stride);

    let mut out = vec![0.0f32; n * c * oh * ow];
    for ni in 0..n {
        for ci in 0..c {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = match mode {
                        PoolMode::Max => f32::NEG_INFINITY,
                        PoolMode::Avg => 0.0,
                    };
                    for ky in 0..kernel {
                        for kx in 0..kernel {
                            let iy = y * stride + ky;
                            let ix = x * stride + kx;
                            if iy < padding || ix < padding {
                                continue;
                            }
                            let (iy, ix) = (iy - padding, ix - padding);
                            if iy >= h || ix >= w {
                                continue;
                            }
                            let v = input[((ni * c + ci) * h + iy) * w + ix];
                            match mode {
                                PoolMode::Max => acc = acc.max(v),
                                PoolMode::Avg => acc += v,
                            }
                        }
                    }
                    if mode == PoolMode::Avg {
                        acc /= (kernel * kernel) as f32;
                    }
                    out[((ni * c + ci) * oh + y) * ow + x] = acc;
                }
            }
        }
    }
    out
}

/// Backward of `pool2d`: max routes each lane's gradient to the first
/// maximum in its window, avg spreads it uniformly.
pub fn pool2d_grad(
    input: &[f32],
    grad: &[f32],
    in_shape: &Shape,
    kernel: usize,
    stride: usize,
    padding: usize,
    mode: PoolMode,
) -> Vec<f32> {
    let (n, c, h, w) = nchw(in_shape);
    let oh = out_extent(h, kernel, padding, stride);
    let ow = out_extent(w, kernel, padding, stride);

    let mut out = vec![0.0f32; n * c * h * w];
    for ni in 0..n {
        for ci in 0..c {
            for y in 0..oh {
                for x in 0..ow {
                    let g = grad[((ni * c + ci) * oh + y) * ow + x];
                    match mode {
                        PoolMode::Max => {
                            let mut best: Option<(usize, f32)> = None;
                            for ky in 0..kernel {
                                for kx in 0..kernel {
                                    let iy = y * stride + ky;
                                    let ix = x * stride + kx;
                                    if iy < padding || ix < padding {
                                        continue;
                                    }
                                    let (iy, ix) = (iy - padding, ix - padding);
                                    if iy >= h || ix >= w {
                                        continue;
                                    }
                                    let idx = ((ni * c + ci) * h + iy) * w + ix;
                                    let v = input[idx];
                                    if best.map(|(_, bv)| v > bv).unwrap_or(true) {
                                        best = Some((idx, v));
                                    }
                                }
                            }
                            if let Some((idx, _)) = best {
                                out[idx] += g;
                            }
                        }
                        PoolMode::Avg => {
                            let share = g / (kernel * kernel) as f32;
                            for ky in 0..kernel {
                                for kx in 0..kernel {
                                    let iy = y * stride + ky;
                                    let ix = x * stride + kx;
                                    if iy < padding || ix < padding {
                                        continue;
                                    }
                                    let (iy, ix) = (iy - padding, ix - padding);
                                    if iy >= h || ix >= w {
                                        continue;
                                    }
                                    out[((ni * c + ci) * h + iy) * w + ix] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

fn nchw(shape: &Shape) -> (usize, usize, usize, usize) {
    (
        shape.0[0] as usize,
        shape.0[1] as usize,
        shape.0[2] as usize,
        shape.0[3] as usize,
    )
}

fn out_extent(input: usize, kernel: usize, padding: usize, stride: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}
