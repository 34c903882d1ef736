use burn::module::Ignored;
use burn::prelude::*;

use super::routed;

/// `[route]`: channel-wise concatenation of earlier outputs.
#[derive(Module, Debug, Clone)]
pub struct FeatureConcat {
    /// Absolute layer indices, in concatenation order.
    pub layers: Ignored<Vec<usize>>,
}

impl FeatureConcat {
    pub fn new(layers: Vec<usize>) -> Self {
        Self {
            layers: Ignored(layers),
        }
    }

    pub fn forward<B: Backend>(&self, outputs: &[Option<Tensor<B, 4>>]) -> Tensor<B, 4> {
        match self.layers.as_slice() {
            [single] => routed(outputs, *single).clone(),
            layers => Tensor::cat(
                layers.iter().map(|&l| routed(outputs, l).clone()).collect(),
                1,
            ),
        }
    }
}
