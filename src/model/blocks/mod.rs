pub mod concat;
pub mod conv;
pub mod fusion;
pub mod maxpool;
pub mod mix_conv;
pub mod resize;
pub mod upsample;
pub mod yolo_layer;

pub use concat::FeatureConcat;
pub use conv::{batch_norm, fuse_conv_and_bn, Activation, ConvBlock, ConvBlockConfig, ConvKind};
pub use fusion::WeightedFeatureFusion;
pub use maxpool::MaxPool;
pub use mix_conv::{split_channels, ChannelSplit, MixConv2d};
pub use resize::{pad_to, scale_image};
pub use upsample::Upsample2d;
pub use yolo_layer::{ExportOutput, YoloLayer};

use burn::prelude::*;

/// Output kept for `layer` during a forward pass.
///
/// The routing mask is computed from the same indices the concat and fusion
/// nodes read, so a missing entry is a broken graph, not bad input.
pub(crate) fn routed<B: Backend>(outputs: &[Option<Tensor<B, 4>>], layer: usize) -> &Tensor<B, 4> {
    match outputs.get(layer) {
        Some(Some(tensor)) => tensor,
        _ => panic!("output of layer {layer} was read but not retained by the routing mask"),
    }
}
