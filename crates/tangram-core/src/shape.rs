//! Shape rules: axis resolution, reshape inference, axis insertion/removal.
//!
//! These are pure functions over [`Shape`]; the dispatcher in `tensor.rs`
//! calls them before touching the arena so that every shape error surfaces
//! before any allocation happens.

use crate::types::Shape;
use crate::{Result, TangramError};

/// Resolve a possibly-negative axis against a rank, with bounds checking.
pub fn resolve_axis(axis: i64, ndim: usize) -> Result<usize> {
    let ndim_i = ndim as i64;
    let resolved = if axis < 0 { ndim_i + axis } else { axis };
    if resolved < 0 || resolved >= ndim_i {
        return Err(TangramError::InvalidArgument(format!(
            "axis {axis} out of range for ndim {ndim}"
        )));
    }
    Ok(resolved as usize)
}

/// Resolve a requested reshape against the current shape.
///
/// At most one dimension may be the wildcard `-1`; it is inferred from the
/// element count. Explicit dimensions must be positive, and the product of
/// all dimensions must equal the current element count.
pub fn resolve_reshape(old: &Shape, requested: &[i64]) -> Result<Shape> {
    let numel = old.numel();

    let mut wildcard: Option<usize> = None;
    let mut known: i64 = 1;
    for (i, &d) in requested.iter().enumerate() {
        if d == -1 {
            if wildcard.is_some() {
                return Err(TangramError::InvalidArgument(
                    "can only specify one unknown dimension (-1) in reshape".into(),
                ));
            }
            wildcard = Some(i);
        } else if d <= 0 {
            return Err(TangramError::InvalidArgument(format!(
                "reshape dimension must be positive or -1, got {d}"
            )));
        } else {
            known *= d;
        }
    }

    let mut dims = requested.to_vec();
    if let Some(idx) = wildcard {
        if known == 0 || numel % known != 0 {
            return Err(TangramError::InvalidArgument(format!(
                "cannot infer wildcard dimension: {numel} elements do not divide into {known}"
            )));
        }
        dims[idx] = numel / known;
    } else if known != numel {
        return Err(TangramError::ShapeMismatch {
            expected: old.0.clone(),
            got: requested.to_vec(),
        });
    }

    Ok(Shape::new(dims))
}

/// Insert size-1 axes at the given positions (positions refer to the
/// expanded shape, resolved in ascending order).
pub fn insert_axes(shape: &Shape, axes: &[i64]) -> Result<Shape> {
    let mut dims = shape.0.clone();
    let mut resolved: Vec<usize> = Vec::with_capacity(axes.len());
    for &ax in axes {
        let ndim = dims.len() + 1;
        let idx = if ax < 0 { ndim as i64 + ax } else { ax };
        if idx < 0 || idx > dims.len() as i64 {
            return Err(TangramError::InvalidArgument(format!(
                "cannot insert axis {ax} into shape {shape}"
            )));
        }
        resolved.push(idx as usize);
    }
    resolved.sort_unstable();
    for &idx in &resolved {
        dims.insert(idx, 1);
    }
    Ok(Shape::new(dims))
}

/// Remove the given axes, each of which must have size 1.
///
/// Removing every axis yields the scalar shape `[1]`.
pub fn remove_axes(shape: &Shape, axes: &[i64]) -> Result<Shape> {
    let mut resolved: Vec<usize> = Vec::with_capacity(axes.len());
    for &ax in axes {
        let idx = resolve_axis(ax, shape.ndim())?;
        let size = shape.0[idx];
        if size != 1 {
            return Err(TangramError::InvalidArgument(format!(
                "cannot remove axis {ax} of size {size} from shape {shape}"
            )));
        }
        resolved.push(idx);
    }
    resolved.sort_unstable();
    resolved.dedup();
    let mut dims = shape.0.clone();
    for &idx in resolved.iter().rev() {
        dims.remove(idx);
    }
    if dims.is_empty() {
        dims.push(1);
    }
    Ok(Shape::new(dims))
}

/// Drop every size-1 axis. An all-ones shape collapses to `[1]`.
pub fn squeeze_all_units(shape: &Shape) -> Shape {
    let mut dims: Vec<i64> = shape.0.iter().copied().filter(|&d| d != 1).collect();
    if dims.is_empty() {
        dims.push(1);
    }
    Shape::new(dims)
}

/// Output extent of a convolution/pooling window along one dimension.
pub fn window_out_dim(input: i64, kernel: usize, padding: usize, stride: usize) -> Result<i64> {
    let padded = input + 2 * padding as i64;
    if padded < kernel as i64 {
        return Err(TangramError::InvalidArgument(format!(
            "window of size {kernel} does not fit input extent {input} with padding {padding}"
        )));
    }
    Ok((padded - kernel as i64) / stride as i64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(dims: &[i64]) -> Shape {
        Shape::new(dims.to_vec())
    }

    #[test]
    fn test_resolve_axis() {
        assert_eq!(resolve_axis(0, 3).unwrap(), 0);
        assert_eq!(resolve_axis(-1, 3).unwrap(), 2);
        assert_eq!(resolve_axis(-3, 3).unwrap(), 0);
        assert!(resolve_axis(3, 3).is_err());
        assert!(resolve_axis(-4, 3).is_err());
    }

    #[test]
    fn test_reshape_exact() {
        assert_eq!(resolve_reshape(&s(&[2, 3]), &[3, 2]).unwrap(), s(&[3, 2]));
        assert_eq!(resolve_reshape(&s(&[2, 3]), &[6]).unwrap(), s(&[6]));
        assert!(resolve_reshape(&s(&[2, 3]), &[4, 2]).is_err());
    }

    #[test]
    fn test_reshape_wildcard() {
        assert_eq!(resolve_reshape(&s(&[2, 3]), &[-1]).unwrap(), s(&[6]));
        assert_eq!(
            resolve_reshape(&s(&[2, 3, 4]), &[-1, 4]).unwrap(),
            s(&[6, 4])
        );
        assert_eq!(
            resolve_reshape(&s(&[2, 3, 4]), &[2, -1, 2]).unwrap(),
            s(&[2, 6, 2])
        );
    }

    #[test]
    fn test_reshape_wildcard_errors() {
        assert!(resolve_reshape(&s(&[2, 3]), &[-1, -1]).is_err());
        assert!(resolve_reshape(&s(&[2, 3]), &[-1, 4]).is_err());
        assert!(resolve_reshape(&s(&[2, 3]), &[0, 6]).is_err());
    }

    #[test]
    fn test_insert_axes() {
        assert_eq!(insert_axes(&s(&[2, 3]), &[0]).unwrap(), s(&[1, 2, 3]));
        assert_eq!(insert_axes(&s(&[2, 3]), &[-1]).unwrap(), s(&[2, 3, 1]));
        assert_eq!(insert_axes(&s(&[2, 3]), &[0, 2]).unwrap(), s(&[1, 2, 1, 3]));
    }

    #[test]
    fn test_remove_axes() {
        assert_eq!(remove_axes(&s(&[1, 2, 1, 3]), &[0, 2]).unwrap(), s(&[2, 3]));
        assert_eq!(remove_axes(&s(&[1]), &[0]).unwrap(), s(&[1]));
        let err = remove_axes(&s(&[2, 3]), &[1]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("axis 1"), "unexpected message: {msg}");
        assert!(msg.contains("size 3"), "unexpected message: {msg}");
    }

    #[test]
    fn test_squeeze_all_units() {
        assert_eq!(squeeze_all_units(&s(&[1, 3, 1])), s(&[3]));
        assert_eq!(squeeze_all_units(&s(&[1, 1])), s(&[1]));
        assert_eq!(squeeze_all_units(&s(&[2, 3])), s(&[2, 3]));
    }

    #[test]
    fn test_window_out_dim() {
        // 28x28 input, 5x5 kernel, no padding, stride 1 -> 24
        assert_eq!(window_out_dim(28, 5, 0, 1).unwrap(), 24);
        // with stride 2 -> 12
        assert_eq!(window_out_dim(28, 5, 0, 2).unwrap(), 12);
        // padding grows the output
        assert_eq!(window_out_dim(28, 5, 2, 1).unwrap(), 28);
        assert!(window_out_dim(3, 5, 0, 1).is_err());
    }
}
