use std::path::Path;

use burn::module::Ignored;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::blocks::{scale_image, ChannelSplit, ExportOutput, YoloLayer};
use super::builder::create_modules;
use super::layer::Layer;
use crate::config::{load_model_config, LayerSpec};
use crate::error::ConfigError;

/// Test-time augmentation passes: `(scale, flipped)` after the original.
const AUGMENT_PASSES: [(f64, bool); 2] = [(0.83, true), (0.67, false)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DarknetConfig {
    /// `(height, width)` the model is trained and exported at.
    pub image_size: [usize; 2],
    pub gray: bool,
    /// Build a fixed-shape graph (batch 1, grids from `image_size`).
    pub export: bool,
    /// Configuration file name; some architecture families reverse head strides.
    pub config_name: String,
    pub channel_split: ChannelSplit,
}

impl Default for DarknetConfig {
    fn default() -> Self {
        Self {
            image_size: [416, 416],
            gray: false,
            export: false,
            config_name: String::new(),
            channel_split: ChannelSplit::EqualParams,
        }
    }
}

/// Leading fields of a darknet `.weights` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DarknetHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    /// Images seen during training.
    pub seen: i64,
}

impl Default for DarknetHeader {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 2,
            revision: 5,
            seen: 0,
        }
    }
}

/// YOLOv3 model assembled from a Darknet configuration.
#[derive(Module, Debug)]
pub struct Darknet<B: Backend> {
    pub layers: Vec<Layer<B>>,
    routs: Ignored<Vec<bool>>,
    yolo_layers: Ignored<Vec<usize>>,
    config: Ignored<DarknetConfig>,
    header: Ignored<DarknetHeader>,
}

impl<B: Backend> Darknet<B> {
    pub fn new(specs: &[LayerSpec], config: &DarknetConfig, device: &B::Device) -> Result<Self, ConfigError> {
        let graph = create_modules(specs, config, device)?;

        let model = Self {
            layers: graph.layers,
            routs: Ignored(graph.routs),
            yolo_layers: Ignored(graph.yolo_layers),
            config: Ignored(config.clone()),
            header: Ignored(DarknetHeader::default()),
        };
        log::info!(
            "Model Summary: {} layers, {} parameters, {} detection heads",
            model.layers.len(),
            model.num_params(),
            model.yolo_layers.len()
        );
        Ok(model)
    }

    /// Reads and builds a `.cfg` file; the file name also becomes the
    /// configuration name unless one is already set.
    pub fn from_cfg_file(
        path: impl AsRef<Path>,
        config: &DarknetConfig,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let specs = load_model_config(path.as_ref())?;
        let mut config = config.clone();
        if config.config_name.is_empty() {
            config.config_name = path.as_ref().display().to_string();
        }
        Self::new(&specs, &config, device)
    }

    pub fn config(&self) -> &DarknetConfig {
        &self.config
    }

    pub fn header(&self) -> DarknetHeader {
        *self.header
    }

    pub fn set_header(&mut self, header: DarknetHeader) {
        self.header = Ignored(header);
    }

    pub fn routs(&self) -> &[bool] {
        &self.routs
    }

    pub fn yolo_layer_indices(&self) -> &[usize] {
        &self.yolo_layers
    }

    /// Detection heads in head order.
    pub fn yolo_layers(&self) -> Vec<&YoloLayer> {
        self.yolo_layers
            .iter()
            .filter_map(|&i| self.layers[i].as_yolo())
            .collect()
    }

    /// Runs every layer and returns the tensor fed into each head.
    fn head_inputs(&self, x: Tensor<B, 4>) -> Vec<(&YoloLayer, Tensor<B, 4>)> {
        let mut outputs: Vec<Option<Tensor<B, 4>>> = Vec::with_capacity(self.layers.len());
        let mut heads = Vec::with_capacity(self.yolo_layers.len());
        let mut x = x;

        for (i, layer) in self.layers.iter().enumerate() {
            x = match layer {
                Layer::Convolutional(block) => block.forward(x),
                Layer::BatchNorm(bn) => bn.forward(x),
                Layer::MaxPool(pool) => pool.forward(x),
                Layer::Upsample(upsample) => upsample.forward(x),
                Layer::Route(concat) => concat.forward(&outputs),
                Layer::Shortcut(fusion) => fusion.forward(x, &outputs),
                Layer::Yolo(yolo) => {
                    heads.push((yolo, x.clone()));
                    x
                }
                Layer::Dropout(dropout) => dropout.forward(x),
                Layer::Placeholder(_) => x,
            };
            outputs.push(self.routs[i].then(|| x.clone()));
        }

        heads
    }

    /// Training forward: one raw `[B, A, H, W, 5+C]` tensor per head.
    pub fn forward_train(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        self.head_inputs(x)
            .into_iter()
            .map(|(yolo, p)| yolo.reshape(p))
            .collect()
    }

    /// Inference forward: decoded candidates `[B, N, 5+C]` over all heads,
    /// plus the raw per-head tensors.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 3>, Vec<Tensor<B, 5>>) {
        let (decoded, raw): (Vec<_>, Vec<_>) = self
            .head_inputs(x)
            .into_iter()
            .map(|(yolo, p)| yolo.decode(p))
            .unzip();
        for (i, d) in decoded.iter().enumerate() {
            log::debug!("head {i}: {:?} candidates", d.dims());
        }
        (Tensor::cat(decoded, 1), raw)
    }

    /// Fixed-shape forward for export, batch size 1. Returns class scores
    /// `[N, C]` and normalized boxes `[N, 4]` concatenated over heads.
    pub fn forward_export(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let outputs: Vec<ExportOutput<B>> = self
            .head_inputs(x)
            .into_iter()
            .map(|(yolo, p)| yolo.export(p))
            .collect();

        let mut scores = Vec::with_capacity(outputs.len());
        let mut xy = Vec::with_capacity(outputs.len());
        let mut wh = Vec::with_capacity(outputs.len());
        for output in outputs {
            scores.push(output.scores);
            xy.push(output.xy);
            wh.push(output.wh);
        }
        let boxes = Tensor::cat(vec![Tensor::cat(xy, 0), Tensor::cat(wh, 0)], 1);
        (Tensor::cat(scores, 0), boxes)
    }

    /// Inference with test-time augmentation.
    ///
    /// Runs the original batch, a mirrored copy scaled by 0.83 and a copy
    /// scaled by 0.67, each padded up to a multiple of 64 pixels. Every pass is
    /// decoded on its own grid, mapped back to the original image frame and
    /// concatenated. Passes without candidates are dropped.
    pub fn forward_augmented(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [_, _, _, width] = x.dims();
        let (original, _) = self.forward(x.clone());
        let mut passes = vec![original];

        for (scale, flipped) in AUGMENT_PASSES {
            let image = if flipped { x.clone().flip([3]) } else { x.clone() };
            let (detections, _) = self.forward(scale_image(image, scale, false));
            let [batch, candidates, attributes] = detections.dims();
            if candidates == 0 {
                log::debug!("augmented pass at scale {scale} produced no candidates");
                continue;
            }

            let boxes = detections
                .clone()
                .slice([0..batch, 0..candidates, 0..4])
                / scale as f32;
            let boxes = if flipped {
                let x_center = boxes.clone().slice([0..batch, 0..candidates, 0..1]);
                let mirrored = x_center.neg().add_scalar(width as f32);
                boxes.slice_assign([0..batch, 0..candidates, 0..1], mirrored)
            } else {
                boxes
            };
            let rest = detections.slice([0..batch, 0..candidates, 4..attributes]);
            passes.push(Tensor::cat(vec![boxes, rest], 2));
        }

        Tensor::cat(passes, 1)
    }

    /// Folds every convolution's batch norm into its weights. The original
    /// model is left untouched.
    pub fn fuse(&self) -> Self {
        log::info!("Fusing layers...");
        let layers = self
            .layers
            .iter()
            .map(|layer| match layer {
                Layer::Convolutional(block) => Layer::Convolutional(block.fuse()),
                other => other.clone(),
            })
            .collect();

        Self {
            layers,
            routs: self.routs.clone(),
            yolo_layers: self.yolo_layers.clone(),
            config: self.config.clone(),
            header: self.header.clone(),
        }
    }
}
