use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

#[derive(Module, Debug, Clone)]
pub struct Upsample2d {
    scale_factor: usize,
    /// Fixed `(height, width)` output used by export graphs instead of a scale.
    size: Ignored<Option<[usize; 2]>>,
}

impl Upsample2d {
    pub fn new(scale_factor: usize) -> Self {
        Self {
            scale_factor,
            size: Ignored(None),
        }
    }

    pub fn with_size(size: [usize; 2]) -> Self {
        Self {
            scale_factor: 1,
            size: Ignored(Some(size)),
        }
    }

    /// Nearest-neighbor upsample.
    /// [B, C, H, W] -> [B, C, H*scale, W*scale], or [B, C, size.0, size.1]
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(size) = *self.size {
            return interpolate(x, size, InterpolateOptions::new(InterpolateMode::Nearest));
        }

        let [batch, channels, height, width] = x.dims();
        let scale = self.scale_factor;

        // [B, C, H, 1, W, 1] -> [B, C, H, scale, W, scale]
        let x = x.reshape([batch, channels, height, 1, width, 1]);
        let x = x.repeat_dim(3, scale).repeat_dim(5, scale);

        x.reshape([batch, channels, height * scale, width * scale])
    }
}
