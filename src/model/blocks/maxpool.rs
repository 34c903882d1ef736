use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

/// Darknet max-pooling. A 2x2 window with stride 1 first pads one zero
/// row and column on the bottom and right so the spatial size is kept.
#[derive(Module, Clone, Debug)]
pub struct MaxPool {
    pool: MaxPool2d,
    zero_pad: bool,
}

impl MaxPool {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        let padding = (kernel_size - 1) / 2;
        let pool = MaxPool2dConfig::new([kernel_size, kernel_size])
            .with_strides([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init();

        Self {
            pool,
            zero_pad: kernel_size == 2 && stride == 1,
        }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.zero_pad {
            x.pad((0, 1, 0, 1), 0.0)
        } else {
            x
        };
        self.pool.forward(x)
    }
}
