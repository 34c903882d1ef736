use burn::module::Ignored;
use burn::nn::{BatchNorm, Dropout};
use burn::prelude::*;

use super::blocks::conv::{ConvBlockRecord, ConvKindRecord};
use super::blocks::{ConvBlock, ConvKind, FeatureConcat, MaxPool, Upsample2d, WeightedFeatureFusion, YoloLayer};

/// Pass-through node for `reorg3d` and unrecognized block kinds.
#[derive(Module, Debug, Clone)]
pub struct Placeholder {
    pub kind: Ignored<String>,
}

impl Placeholder {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: Ignored(kind.to_string()),
        }
    }
}

/// One node of the module graph, one per configuration block.
#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    Convolutional(ConvBlock<B>),
    BatchNorm(BatchNorm<B>),
    MaxPool(MaxPool),
    Upsample(Upsample2d),
    Route(FeatureConcat),
    Shortcut(WeightedFeatureFusion<B>),
    Yolo(YoloLayer),
    Dropout(Dropout),
    Placeholder(Placeholder),
}

impl<B: Backend> Layer<B> {
    pub fn name(&self) -> &str {
        match self {
            Self::Convolutional(_) => "convolutional",
            Self::BatchNorm(_) => "batchnorm",
            Self::MaxPool(_) => "maxpool",
            Self::Upsample(_) => "upsample",
            Self::Route(_) => "route",
            Self::Shortcut(_) => "shortcut",
            Self::Yolo(_) => "yolo",
            Self::Dropout(_) => "dropout",
            Self::Placeholder(placeholder) => placeholder.kind.as_str(),
        }
    }

    /// Absolute indices of earlier layers this node reads.
    pub fn sources(&self) -> &[usize] {
        match self {
            Self::Route(concat) => concat.layers.as_slice(),
            Self::Shortcut(fusion) => fusion.layers.as_slice(),
            Self::Yolo(yolo) => yolo.layers.as_slice(),
            _ => &[],
        }
    }

    pub fn as_conv(&self) -> Option<&ConvBlock<B>> {
        match self {
            Self::Convolutional(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_conv_mut(&mut self) -> Option<&mut ConvBlock<B>> {
        match self {
            Self::Convolutional(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_yolo(&self) -> Option<&YoloLayer> {
        match self {
            Self::Yolo(yolo) => Some(yolo),
            _ => None,
        }
    }

    /// Variant name, `placeholder` for every pass-through node.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placeholder(_) => "placeholder",
            Self::Convolutional(_) => "convolutional",
            Self::BatchNorm(_) => "batchnorm",
            Self::MaxPool(_) => "maxpool",
            Self::Upsample(_) => "upsample",
            Self::Route(_) => "route",
            Self::Shortcut(_) => "shortcut",
            Self::Yolo(_) => "yolo",
            Self::Dropout(_) => "dropout",
        }
    }

    /// Dimensions of every stored tensor: conv branches (weight, then bias),
    /// then norm gamma and beta; fusion weights for shortcuts.
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        match self {
            Self::Convolutional(block) => {
                let mut shapes = Vec::new();
                let branches = match &block.conv {
                    ConvKind::Single(conv) => vec![conv],
                    ConvKind::Mixed(mix) => mix.branches.iter().collect(),
                };
                for conv in branches {
                    shapes.push(conv.weight.dims().to_vec());
                    shapes.extend(conv.bias.iter().map(|b| b.dims().to_vec()));
                }
                if let Some(bn) = &block.norm {
                    shapes.push(bn.gamma.dims().to_vec());
                    shapes.push(bn.beta.dims().to_vec());
                }
                shapes
            }
            Self::BatchNorm(bn) => vec![bn.gamma.dims().to_vec(), bn.beta.dims().to_vec()],
            Self::Shortcut(fusion) => fusion.weights.iter().map(|w| w.dims().to_vec()).collect(),
            _ => Vec::new(),
        }
    }
}

impl<B: Backend> LayerRecord<B> {
    /// Same as [`Layer::kind`] for a stored layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placeholder(_) => "placeholder",
            Self::Convolutional(_) => "convolutional",
            Self::BatchNorm(_) => "batchnorm",
            Self::MaxPool(_) => "maxpool",
            Self::Upsample(_) => "upsample",
            Self::Route(_) => "route",
            Self::Shortcut(_) => "shortcut",
            Self::Yolo(_) => "yolo",
            Self::Dropout(_) => "dropout",
        }
    }

    /// Same order as [`Layer::parameter_shapes`].
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        match self {
            Self::Convolutional(block) => conv_record_shapes(block),
            Self::BatchNorm(bn) => vec![bn.gamma.dims().to_vec(), bn.beta.dims().to_vec()],
            Self::Shortcut(fusion) => fusion.weights.iter().map(|w| w.dims().to_vec()).collect(),
            _ => Vec::new(),
        }
    }
}

fn conv_record_shapes<B: Backend>(block: &ConvBlockRecord<B>) -> Vec<Vec<usize>> {
    let branches = match &block.conv {
        ConvKindRecord::Single(conv) => vec![conv],
        ConvKindRecord::Mixed(mix) => mix.branches.iter().collect(),
    };
    let mut shapes = Vec::new();
    for conv in branches {
        shapes.push(conv.weight.dims().to_vec());
        shapes.extend(conv.bias.iter().map(|b| b.dims().to_vec()));
    }
    if let Some(bn) = &block.norm {
        shapes.push(bn.gamma.dims().to_vec());
        shapes.push(bn.beta.dims().to_vec());
    }
    shapes
}
