pub mod config;
pub mod error;
pub mod model;
pub mod training;
pub mod weights;

// Re-exports for convenience
pub use config::{load_model_config, parse_model_config, LayerSpec};
pub use error::{ConfigError, Error, Result, TargetError, WeightsError};
pub use model::{compute_loss, extract_detections, Darknet, DarknetConfig, Detection, LossConfig, TargetBox, NMS};
pub use training::{Trainer, TrainingConfig};
