use burn::module::{Ignored, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;
use serde::{Deserialize, Serialize};

use super::mix_conv::MixConv2d;

pub const BN_MOMENTUM: f64 = 0.03;
pub const BN_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Leaky,
    /// Darknet's `swish` is built as hard-swish.
    HardSwish,
    Mish,
}

impl Activation {
    pub fn from_name(name: &str) -> Self {
        match name {
            "leaky" => Self::Leaky,
            "swish" => Self::HardSwish,
            "mish" => Self::Mish,
            _ => Self::Linear,
        }
    }

    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Linear => x,
            Self::Leaky => activation::leaky_relu(x, 0.1),
            Self::HardSwish => x.clone() * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            Self::Mish => activation::mish(x),
        }
    }
}

#[derive(Module, Debug)]
pub enum ConvKind<B: Backend> {
    Single(Conv2d<B>),
    Mixed(MixConv2d<B>),
}

impl<B: Backend> ConvKind<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Single(conv) => conv.forward(x),
            Self::Mixed(mix) => mix.forward(x),
        }
    }

    /// Convolutions in output-channel order; a single conv is one branch.
    pub fn branches(&self) -> Vec<&Conv2d<B>> {
        match self {
            Self::Single(conv) => vec![conv],
            Self::Mixed(mix) => mix.branches.iter().collect(),
        }
    }

    pub fn branches_mut(&mut self) -> Vec<&mut Conv2d<B>> {
        match self {
            Self::Single(conv) => vec![conv],
            Self::Mixed(mix) => mix.branches.iter_mut().collect(),
        }
    }
}

/// One `[convolutional]` block: convolution, optional batch norm, activation.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: ConvKind<B>,
    pub norm: Option<BatchNorm<B>>,
    pub activation: Ignored<Activation>,
}

#[derive(Debug, Clone)]
pub struct ConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    /// (y, x)
    pub stride: [usize; 2],
    pub pad: bool,
    pub groups: usize,
    pub batch_normalize: bool,
    pub activation: Activation,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(device: &B::Device, config: &ConvBlockConfig) -> Self {
        let padding = if config.pad { config.kernel_size / 2 } else { 0 };
        let conv = Conv2dConfig::new(
            [config.in_channels, config.out_channels],
            [config.kernel_size, config.kernel_size],
        )
        .with_stride(config.stride)
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_groups(config.groups)
        .with_bias(!config.batch_normalize)
        .init(device);

        Self::from_parts(
            ConvKind::Single(conv),
            config.batch_normalize.then(|| batch_norm(device, config.out_channels)),
            config.activation,
        )
    }

    pub fn from_parts(conv: ConvKind<B>, norm: Option<BatchNorm<B>>, activation: Activation) -> Self {
        Self {
            conv,
            norm,
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(bn) => bn.forward(x),
            None => x,
        };
        self.activation.apply(x)
    }

    pub fn out_channels(&self) -> usize {
        self.conv
            .branches()
            .iter()
            .map(|conv| conv.weight.dims()[0])
            .sum()
    }

    /// Folds the batch norm into the convolution weights and bias.
    ///
    /// Blocks without a norm are returned unchanged. For a multi-branch
    /// convolution each branch is folded with its own slice of the norm
    /// statistics.
    pub fn fuse(&self) -> Self {
        let Some(bn) = &self.norm else {
            return self.clone();
        };

        let gamma = bn.gamma.val();
        let beta = bn.beta.val();
        let mean = bn.running_mean.value();
        let var = bn.running_var.value();

        let mut conv = self.conv.clone();
        let mut start = 0;
        for branch in conv.branches_mut() {
            let channels = branch.weight.dims()[0];
            let range = [start..start + channels];
            *branch = fuse_conv_and_bn(
                branch,
                gamma.clone().slice(range.clone()),
                beta.clone().slice(range.clone()),
                mean.clone().slice(range.clone()),
                var.clone().slice(range),
                bn.epsilon,
            );
            start += channels;
        }

        Self::from_parts(conv, None, *self.activation)
    }
}

pub fn batch_norm<B: Backend>(device: &B::Device, channels: usize) -> BatchNorm<B> {
    BatchNormConfig::new(channels)
        .with_momentum(BN_MOMENTUM)
        .with_epsilon(BN_EPSILON)
        .init(device)
}

/// `W' = diag(g / sqrt(var + eps)) W`,
/// `b' = diag(g / sqrt(var + eps)) b + (beta - g * mean / sqrt(var + eps))`.
pub fn fuse_conv_and_bn<B: Backend>(
    conv: &Conv2d<B>,
    gamma: Tensor<B, 1>,
    beta: Tensor<B, 1>,
    mean: Tensor<B, 1>,
    var: Tensor<B, 1>,
    epsilon: f64,
) -> Conv2d<B> {
    let weight = conv.weight.val().detach();
    let [out_channels, _, _, _] = weight.dims();
    let device = weight.device();

    let scale = gamma.detach() / var.detach().add_scalar(epsilon).sqrt();
    let fused_weight = weight * scale.clone().reshape([out_channels, 1, 1, 1]);

    let conv_bias = match &conv.bias {
        Some(bias) => bias.val().detach(),
        None => Tensor::zeros([out_channels], &device),
    };
    let bn_bias = beta.detach() - scale.clone() * mean.detach();
    let fused_bias = scale * conv_bias + bn_bias;

    let mut fused = conv.clone();
    fused.weight = Param::from_tensor(fused_weight);
    fused.bias = Some(Param::from_tensor(fused_bias));
    fused
}
