//! 2-D convolution layer.

use std::sync::Arc;

use tracing::debug;

use tangram_core::{Engine, Result, Tensor};

use crate::Module;

/// NCHW convolution: weight `[out_channels, in_channels, k, k]`, bias
/// (optional) `[1, out_channels, 1, 1]` so it broadcasts over batch and
/// spatial dims.
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Fresh layer with uniform init in `[0, sqrt(1 / (in_channels * k * k)))`.
    pub fn new(
        engine: &Arc<Engine>,
        in_channels: i64,
        out_channels: i64,
        kernel: i64,
        stride: usize,
        padding: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel * kernel;
        let bound = (1.0 / fan_in as f32).sqrt();
        let weight = engine.rand(&[out_channels, in_channels, kernel, kernel], 0.0, bound)?;
        engine.keep(&weight)?;
        let bias = if with_bias {
            let b = engine.rand(&[1, out_channels, 1, 1], 0.0, bound)?;
            engine.keep(&b)?;
            Some(b)
        } else {
            None
        };
        debug!(in_channels, out_channels, kernel, stride, padding, "conv layer");
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
        })
    }

    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, stride: usize, padding: usize) -> Self {
        Self {
            weight,
            bias,
            stride,
            padding,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let y = input.conv2d(&self.weight, self.stride, self.padding)?;
        match &self.bias {
            Some(bias) => y.add(bias),
            None => Ok(y),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{prefix}.bias"), bias.clone()));
        }
        params
    }
}
