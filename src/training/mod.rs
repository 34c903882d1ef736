use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{ConfigError, TargetError};
use crate::model::{compute_loss, extract_detections, Darknet, Detection, LossComponents, TargetBox, NMS};

pub mod config;

pub use config::TrainingConfig;

/// Owns a model and its Adam state; one call to `train_step` is one update.
pub struct Trainer<B>
where
    B: AutodiffBackend,
{
    pub model: Darknet<B>,
    pub optimizer: OptimizerAdaptor<Adam, Darknet<B>, B>,
    pub config: TrainingConfig,
    steps: usize,
}

impl<B> Trainer<B>
where
    B: AutodiffBackend,
{
    pub fn new(model: Darknet<B>, config: TrainingConfig) -> Self {
        let optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
            .init::<B, Darknet<B>>();

        Self {
            model,
            optimizer,
            config,
            steps: 0,
        }
    }

    /// Builds the model from `config.cfg` with `config.model` options.
    pub fn from_config(config: TrainingConfig, device: &B::Device) -> Result<Self, ConfigError> {
        let model = Darknet::from_cfg_file(&config.cfg, &config.model, device)?;
        Ok(Self::new(model, config))
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Forward, composite loss, backward and one optimizer step.
    ///
    /// Targets are validated before any gradient is computed; on error the
    /// model is unchanged.
    pub fn train_step(&mut self, images: Tensor<B, 4>, targets: &[TargetBox]) -> Result<LossComponents, TargetError> {
        let predictions = self.model.forward_train(images);
        let heads = self.model.yolo_layers();
        let output = compute_loss(&predictions, targets, &heads, &self.config.loss)?;

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        self.steps += 1;

        let c = output.components;
        log::info!(
            "step {}: box {:.4} obj {:.4} cls {:.4} total {:.4} ({} targets)",
            self.steps,
            c.box_loss,
            c.objectness,
            c.classification,
            c.total,
            targets.len()
        );
        Ok(c)
    }

    /// Detections from the current weights, filtered at `conf_threshold`
    /// and reduced by class-aware NMS at `iou_threshold`.
    pub fn detect(&self, images: Tensor<B, 4>) -> Vec<Vec<Detection>> {
        let model = self.model.valid();
        let (decoded, _) = model.forward(images.inner());
        extract_detections(decoded, self.config.conf_threshold)
            .into_iter()
            .map(|detections| NMS::apply(detections, self.config.iou_threshold, self.config.conf_threshold))
            .collect()
    }
}
