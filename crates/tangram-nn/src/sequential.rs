//! Sequential container.

use tangram_core::{Result, Tensor};

use crate::Module;

/// Chains modules, feeding each output into the next layer.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| l.named_parameters(&format!("{prefix}.{i}")))
            .collect()
    }
}

/// Wrap a plain function as a parameterless layer, for activations.
pub struct Lambda<F>(pub F);

impl<F> Module for Lambda<F>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        (self.0)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Linear;
    use tangram_core::{DType, Engine, Shape};

    #[test]
    fn test_chained_forward() {
        let engine = Engine::new();
        let model = Sequential::new()
            .push(Linear::new(&engine, 4, 8, true).unwrap())
            .push(Lambda(|x: &Tensor| x.relu()))
            .push(Linear::new(&engine, 8, 2, true).unwrap());
        let x = engine.ones(&[3, 4], DType::F32).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.shape(), &Shape::new(vec![3, 2]));
        assert_eq!(model.parameters().len(), 4);
    }

    #[test]
    fn test_named_parameters_are_indexed() {
        let engine = Engine::new();
        let model = Sequential::new()
            .push(Linear::new(&engine, 2, 2, false).unwrap())
            .push(Linear::new(&engine, 2, 2, true).unwrap());
        let names: Vec<String> = model
            .named_parameters("net")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["net.0.weight", "net.1.weight", "net.1.bias"]);
    }
}
