#![allow(dead_code)]

use burn::prelude::*;

use yolov3_detection::config::parse_model_config;
use yolov3_detection::model::{Darknet, DarknetConfig};

/// Two heads on a 64x64 input: 2x2 grid at stride 32, 4x4 grid at stride 16.
pub const TWO_HEAD_CFG: &str = r#"
[net]
width=64
height=64
channels=3

# 0: /2
[convolutional]
batch_normalize=1
filters=8
size=3
stride=2
pad=1
activation=leaky

# 1: /4
[convolutional]
batch_normalize=1
filters=16
size=3
stride=2
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=16
size=1
stride=1
pad=1
activation=leaky

[shortcut]
from=-2
activation=linear

# 4: /8
[convolutional]
batch_normalize=1
filters=32
size=3
stride=2
pad=1
activation=mish

# 5: /16
[maxpool]
size=2
stride=2

# 6: /32
[convolutional]
batch_normalize=1
filters=64
size=3
stride=2
pad=1
activation=leaky

[convolutional]
size=1
stride=1
pad=1
filters=21
activation=linear

[yolo]
mask=3,4,5
anchors=10,14,  23,27,  37,58,  81,82,  135,169,  344,319
classes=2
num=6

[route]
layers=-3

[upsample]
stride=2

[route]
layers=-1,5

[convolutional]
size=1
stride=1
pad=1
filters=21
activation=linear

[yolo]
mask=0,1,2
anchors=10,14,  23,27,  37,58,  81,82,  135,169,  344,319
classes=2
num=6
"#;

/// Candidates per image for [`TWO_HEAD_CFG`] at 64x64.
pub const TWO_HEAD_CANDIDATES: usize = 3 * 2 * 2 + 3 * 4 * 4;

pub fn small_config() -> DarknetConfig {
    DarknetConfig {
        image_size: [64, 64],
        config_name: "two-head.cfg".to_string(),
        ..DarknetConfig::default()
    }
}

pub fn two_head_model<B: Backend>(config: &DarknetConfig, device: &B::Device) -> Darknet<B> {
    let specs = parse_model_config(TWO_HEAD_CFG, "two-head.cfg").unwrap();
    Darknet::new(&specs, config, device).unwrap()
}

pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().into_vec().unwrap()
}
