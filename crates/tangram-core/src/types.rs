//! Core type definitions: DType, Shape, PoolMode.

/// Supported data types for tensor elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    I8,
    U8,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::I8 | DType::U8 => 1,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
            DType::I8 => write!(f, "i8"),
            DType::U8 => write!(f, "u8"),
        }
    }
}

/// Pooling mode for `pool2d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Avg,
}

/// Tensor shape (dimensions).
///
/// Rank-0 shapes are never constructed by the engine; the scalar shape
/// is `[1]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    /// The scalar shape `[1]`.
    pub fn scalar() -> Self {
        Self(vec![1])
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> i64 {
        self.0.iter().product()
    }

    /// Get dimension at axis (supports negative indexing).
    pub fn dim(&self, axis: i64) -> Option<i64> {
        let ndim = self.0.len() as i64;
        let idx = if axis < 0 { ndim + axis } else { axis };
        if idx >= 0 && idx < ndim {
            Some(self.0[idx as usize])
        } else {
            None
        }
    }

    /// Row-major element strides.
    pub fn strides(&self) -> Vec<usize> {
        let ndim = self.0.len();
        let mut strides = vec![1usize; ndim];
        for i in (0..ndim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1] as usize;
        }
        strides
    }

    /// Compute the broadcast shape of two shapes, or None if incompatible.
    ///
    /// Dimensions are aligned from the right; a size-1 dimension stretches
    /// to match its partner.
    pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Option<Shape> {
        let a_dims = &a.0;
        let b_dims = &b.0;
        let max_ndim = a_dims.len().max(b_dims.len());

        let mut result = Vec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let da = if i < a_dims.len() {
                a_dims[a_dims.len() - 1 - i]
            } else {
                1
            };
            let db = if i < b_dims.len() {
                b_dims[b_dims.len() - 1 - i]
            } else {
                1
            };

            if da == db {
                result.push(da);
            } else if da == 1 {
                result.push(db);
            } else if db == 1 {
                result.push(da);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape::new(result))
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
