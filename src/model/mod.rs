pub mod blocks;
pub mod builder;
pub mod darknet;
pub mod geometry;
pub mod layer;
pub mod loss;
pub mod nms;
pub mod targets;

pub use darknet::{Darknet, DarknetConfig, DarknetHeader, DarknetRecord};
pub use layer::Layer;
pub use loss::{compute_loss, LossComponents, LossConfig, LossOutput};
pub use nms::{extract_detections, Detection, NMS};
pub use targets::{build_targets, HeadAssignment, TargetBox};
