//! 2-D pooling layer.

use tangram_core::{PoolMode, Result, Tensor};

use crate::Module;

/// NCHW pooling with a square window. Stride defaults to the window size,
/// giving non-overlapping tiles.
pub struct Pool2d {
    kernel: usize,
    stride: Option<usize>,
    padding: usize,
    mode: PoolMode,
}

impl Pool2d {
    pub fn new(kernel: usize, stride: Option<usize>, padding: usize, mode: PoolMode) -> Self {
        Self {
            kernel,
            stride,
            padding,
            mode,
        }
    }

    pub fn max(kernel: usize) -> Self {
        Self::new(kernel, None, 0, PoolMode::Max)
    }

    pub fn avg(kernel: usize) -> Self {
        Self::new(kernel, None, 0, PoolMode::Avg)
    }
}

impl Module for Pool2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        input.pool2d(self.kernel, self.stride, self.padding, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_core::{Engine, Shape};

    #[test]
    fn test_max_pool_tiles() {
        let engine = Engine::new();
        let x = engine
            .tensor(
                &[
                    1.0, 2.0, 5.0, 6.0, //
                    3.0, 4.0, 7.0, 8.0, //
                    9.0, 10.0, 13.0, 14.0, //
                    11.0, 12.0, 15.0, 16.0,
                ],
                &[1, 1, 4, 4],
            )
            .unwrap();
        let y = Pool2d::max(2).forward(&x).unwrap();
        assert_eq!(y.shape(), &Shape::new(vec![1, 1, 2, 2]));
        assert_eq!(y.to_vec_f32().unwrap(), vec![4.0, 8.0, 12.0, 16.0]);
    }

    #[test]
    fn test_avg_pool_overlapping_stride() {
        let engine = Engine::new();
        let x = engine
            .tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], &[1, 1, 3, 3])
            .unwrap();
        let y = Pool2d::new(2, Some(1), 0, PoolMode::Avg).forward(&x).unwrap();
        assert_eq!(y.shape(), &Shape::new(vec![1, 1, 2, 2]));
        assert_eq!(y.to_vec_f32().unwrap(), vec![3.0, 4.0, 6.0, 7.0]);
    }
}
