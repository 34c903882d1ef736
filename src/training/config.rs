use serde::{Deserialize, Serialize};

use crate::model::{DarknetConfig, LossConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Model
    pub cfg: String,
    pub model: DarknetConfig,

    // Optimizer
    pub learning_rate: f64,
    pub weight_decay: f64,

    // Loss gains
    pub loss: LossConfig,

    // Inference
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cfg: "cfg/yolov3-spp.cfg".to_string(),
            model: DarknetConfig::default(),
            learning_rate: 0.00579,
            weight_decay: 0.000484,
            loss: LossConfig::default(),
            conf_threshold: 0.001,
            iou_threshold: 0.6,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: TrainingConfig = serde_yaml::from_str("learning_rate: 0.01\nloss:\n  fl_gamma: 1.5\n").unwrap();
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.loss.fl_gamma, 1.5);
        assert_eq!(config.loss.giou, 3.54);
        assert_eq!(config.model.image_size, [416, 416]);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        let path = path.to_str().unwrap();

        let mut config = TrainingConfig::default();
        config.loss.label_smoothing = 0.1;
        config.save(path).unwrap();

        let reloaded = TrainingConfig::from_yaml(path).unwrap();
        assert_eq!(reloaded.loss, config.loss);
        assert_eq!(reloaded.model, config.model);
    }
}
