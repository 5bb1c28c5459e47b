//! Linear (fully-connected) layer.

use std::sync::Arc;

use tracing::debug;

use tangram_core::{Engine, Result, Tensor};

use crate::Module;

/// A linear layer: `y = x @ W + b`.
///
/// Weight has shape `[in_features, out_features]` so the forward pass
/// needs no transpose. Bias (optional) has shape `[out_features]` and
/// broadcasts over the batch.
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Fresh layer with uniform init in `[0, sqrt(1 / in_features))`.
    /// Parameters are kept, so scope sweeps never reclaim them.
    pub fn new(
        engine: &Arc<Engine>,
        in_features: i64,
        out_features: i64,
        with_bias: bool,
    ) -> Result<Self> {
        let bound = (1.0 / in_features as f32).sqrt();
        let weight = engine.rand(&[in_features, out_features], 0.0, bound)?;
        engine.keep(&weight)?;
        let bias = if with_bias {
            let b = engine.rand(&[out_features], 0.0, bound)?;
            engine.keep(&b)?;
            Some(b)
        } else {
            None
        };
        debug!(in_features, out_features, with_bias, "linear layer");
        Ok(Self { weight, bias })
    }

    /// Build from pre-existing weight and bias tensors.
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let y = input.matmul(&self.weight)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_core::{Engine, Shape};

    #[test]
    fn test_forward_shape() {
        let engine = Engine::new();
        let layer = Linear::new(&engine, 4, 3, true).unwrap();
        let x = engine.ones(&[8, 4], tangram_core::DType::F32).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &Shape::new(vec![8, 3]));
    }

    #[test]
    fn test_known_weights() {
        let engine = Engine::new();
        let w = engine.tensor(&[1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let b = engine.tensor(&[10.0, 20.0], &[2]).unwrap();
        let layer = Linear::from_parts(w, Some(b));
        let x = engine.tensor(&[1.0, 2.0], &[1, 2]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.to_vec_f32().unwrap(), vec![11.0, 22.0]);
    }

    #[test]
    fn test_parameters_survive_scope() {
        // A layer built inside a scope keeps its weights past the sweep.
        let engine = Engine::new();
        let mut layer = None;
        engine
            .scoped(Some("build"), || {
                layer = Some(Linear::new(&engine, 2, 2, true)?);
                Ok(())
            })
            .unwrap();
        let layer = layer.unwrap();
        let x = engine.ones(&[1, 2], tangram_core::DType::F32).unwrap();
        assert!(layer.forward(&x).is_ok());
    }

    #[test]
    fn test_named_parameters() {
        let engine = Engine::new();
        let layer = Linear::new(&engine, 2, 2, true).unwrap();
        let names: Vec<String> = layer
            .named_parameters("fc1")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["fc1.weight", "fc1.bias"]);
    }
}
