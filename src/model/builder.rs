use burn::module::{Ignored, Param, RunningState};
use burn::nn::DropoutConfig;
use burn::prelude::*;

use super::blocks::{
    batch_norm, Activation, ConvBlock, ConvBlockConfig, ConvKind, FeatureConcat, MaxPool, MixConv2d,
    Upsample2d, WeightedFeatureFusion, YoloLayer,
};
use super::darknet::DarknetConfig;
use super::layer::{Layer, Placeholder};
use crate::config::{check_supported_fields, CfgValue, LayerKind, LayerSpec};
use crate::error::ConfigError;

/// Head strides in head order, largest first.
const HEAD_STRIDES: [usize; 3] = [32, 16, 8];

/// Configurations whose heads run from the finest scale up.
const REVERSED_STRIDE_FAMILIES: [&str; 3] = ["panet", "yolov4", "cd53"];

const RGB_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const RGB_VAR: [f32; 3] = [0.0524, 0.0502, 0.0506];

const OBJECTNESS_PRIOR: f32 = -4.5;

/// A freshly assembled module graph.
#[derive(Debug)]
pub struct ModuleGraph<B: Backend> {
    pub layers: Vec<Layer<B>>,
    /// `routs[i]` is true when a later node (or a head) reads layer `i`.
    pub routs: Vec<bool>,
    /// Indices of the detection heads in `layers`.
    pub yolo_layers: Vec<usize>,
}

/// Builds one node per block of `specs`, skipping the `[net]` header.
pub fn create_modules<B: Backend>(
    specs: &[LayerSpec],
    config: &DarknetConfig,
    device: &B::Device,
) -> Result<ModuleGraph<B>, ConfigError> {
    check_supported_fields(specs, &config.config_name)?;
    let blocks = specs.get(1..).filter(|b| !b.is_empty()).ok_or(ConfigError::Empty)?;

    let input_channels = if config.gray { 1 } else { 3 };
    let reverse_strides = REVERSED_STRIDE_FAMILIES
        .iter()
        .any(|family| config.config_name.contains(family));

    let mut layers: Vec<Layer<B>> = Vec::with_capacity(blocks.len());
    let mut output_channels: Vec<usize> = Vec::with_capacity(blocks.len());
    let mut routs = vec![false; blocks.len()];
    let mut yolo_layers = Vec::new();
    let mut yolo_index: i64 = -1;

    for (i, spec) in blocks.iter().enumerate() {
        let channels = output_channels.last().copied().unwrap_or(input_channels);

        let (layer, filters) = match &spec.kind {
            LayerKind::Convolutional => {
                let block = conv_block(spec, i, channels, config, device)?;
                if block.norm.is_none() {
                    routs[i] = true;
                }
                let filters = block.out_channels();
                (Layer::Convolutional(block), filters)
            }
            LayerKind::BatchNorm => {
                let mut bn = batch_norm(device, channels);
                if i == 0 && channels == 3 {
                    bn.running_mean = RunningState::new(Tensor::from_floats(RGB_MEAN, device));
                    bn.running_var = RunningState::new(Tensor::from_floats(RGB_VAR, device));
                }
                (Layer::BatchNorm(bn), channels)
            }
            LayerKind::MaxPool => {
                let size = positive(spec, i, "size")?;
                let stride = spec.int_or(i, "stride", 1)?.max(1) as usize;
                (Layer::MaxPool(MaxPool::new(size, stride)), channels)
            }
            LayerKind::Upsample => {
                let upsample = if config.export {
                    let gain = (yolo_index + 1) as f64 * 2.0 / 32.0;
                    let [h, w] = config.image_size;
                    Upsample2d::with_size([(h as f64 * gain) as usize, (w as f64 * gain) as usize])
                } else {
                    Upsample2d::new(positive(spec, i, "stride")?)
                };
                (Layer::Upsample(upsample), channels)
            }
            LayerKind::Route => {
                let sources = resolve_sources(spec.int_list(i, "layers")?, i)?;
                let filters = sources.iter().map(|&l| output_channels[l]).sum();
                for &l in &sources {
                    routs[l] = true;
                }
                (Layer::Route(FeatureConcat::new(sources)), filters)
            }
            LayerKind::Shortcut => {
                let sources = resolve_sources(spec.int_list(i, "from")?, i)?;
                for &l in &sources {
                    routs[l] = true;
                }
                let fusion = WeightedFeatureFusion::new(device, sources, spec.has("weights_type"));
                (Layer::Shortcut(fusion), channels)
            }
            LayerKind::Reorg3d => (Layer::Placeholder(Placeholder::new("reorg3d")), channels),
            LayerKind::Yolo => {
                yolo_index += 1;
                let head = yolo_head(spec, i, yolo_index as usize, reverse_strides, config)?;
                let expected = head.num_anchors() * head.num_outputs();
                if channels != expected {
                    return Err(ConfigError::InvalidLayer {
                        layer: i,
                        message: format!(
                            "head expects {expected} input channels ({} anchors x {} outputs), got {channels}",
                            head.num_anchors(),
                            head.num_outputs()
                        ),
                    });
                }

                let target = if spec.has("from") {
                    head.layers.get(head.index).copied()
                } else {
                    i.checked_sub(1)
                };
                if let Err(reason) = target
                    .ok_or_else(|| "no layer in front of the head".to_string())
                    .and_then(|j| smart_bias(&mut layers, j, &head))
                {
                    log::warn!("smart bias initialization failure at layer {i}: {reason}");
                }

                for &l in head.layers.iter() {
                    routs[l] = true;
                }
                yolo_layers.push(i);
                (Layer::Yolo(head), channels)
            }
            LayerKind::Dropout => {
                let probability = spec.float(i, "probability")?;
                (Layer::Dropout(DropoutConfig::new(probability).init()), channels)
            }
            LayerKind::Net | LayerKind::Other(_) => {
                log::warn!("unrecognized layer type `{}` at layer {i}", spec.kind.name());
                (Layer::Placeholder(Placeholder::new(spec.kind.name())), channels)
            }
        };

        layers.push(layer);
        output_channels.push(filters);
    }

    Ok(ModuleGraph {
        layers,
        routs,
        yolo_layers,
    })
}

fn positive(spec: &LayerSpec, layer: usize, key: &str) -> Result<usize, ConfigError> {
    match spec.usize(layer, key)? {
        0 => Err(ConfigError::InvalidValue {
            layer,
            field: key.to_string(),
            expected: "a positive integer",
        }),
        v => Ok(v),
    }
}

/// Turns relative indices into absolute ones, rejecting anything that is not
/// an earlier layer.
fn resolve_sources(indices: Vec<i64>, layer: usize) -> Result<Vec<usize>, ConfigError> {
    if indices.is_empty() {
        return Err(ConfigError::InvalidLayer {
            layer,
            message: "no source layers listed".to_string(),
        });
    }
    indices
        .into_iter()
        .map(|l| {
            let absolute = if l < 0 { layer as i64 + l } else { l };
            if (0..layer as i64).contains(&absolute) {
                Ok(absolute as usize)
            } else {
                Err(ConfigError::InvalidReference { layer, target: l })
            }
        })
        .collect()
}

fn conv_block<B: Backend>(
    spec: &LayerSpec,
    i: usize,
    in_channels: usize,
    config: &DarknetConfig,
    device: &B::Device,
) -> Result<ConvBlock<B>, ConfigError> {
    let batch_normalize = spec.int_or(i, "batch_normalize", 0)? != 0;
    let out_channels = positive(spec, i, "filters")?;
    let stride = if spec.has("stride") {
        let s = positive(spec, i, "stride")?;
        [s, s]
    } else {
        [positive(spec, i, "stride_y")?, positive(spec, i, "stride_x")?]
    };
    let activation = Activation::from_name(spec.str_or("activation", "linear"));

    match spec.get("size") {
        Some(CfgValue::IntList(sizes)) => {
            let kernel_sizes = sizes
                .iter()
                .map(|&k| usize::try_from(k).ok().filter(|&k| k > 0))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| ConfigError::InvalidValue {
                    layer: i,
                    field: "size".to_string(),
                    expected: "positive kernel sizes",
                })?;
            let mix = MixConv2d::new(
                device,
                in_channels,
                out_channels,
                &kernel_sizes,
                stride,
                !batch_normalize,
                config.channel_split,
            )
            .map_err(|message| ConfigError::InvalidLayer { layer: i, message })?;
            let norm = batch_normalize.then(|| batch_norm(device, out_channels));
            Ok(ConvBlock::from_parts(ConvKind::Mixed(mix), norm, activation))
        }
        _ => {
            let groups = spec.int_or(i, "groups", 1)?.max(1) as usize;
            if in_channels % groups != 0 || out_channels % groups != 0 {
                return Err(ConfigError::InvalidLayer {
                    layer: i,
                    message: format!("{groups} groups do not divide {in_channels} -> {out_channels} channels"),
                });
            }
            Ok(ConvBlock::new(
                device,
                &ConvBlockConfig {
                    in_channels,
                    out_channels,
                    kernel_size: positive(spec, i, "size")?,
                    stride,
                    pad: spec.int_or(i, "pad", 0)? != 0,
                    groups,
                    batch_normalize,
                    activation,
                },
            ))
        }
    }
}

fn yolo_head(
    spec: &LayerSpec,
    i: usize,
    yolo_index: usize,
    reverse_strides: bool,
    config: &DarknetConfig,
) -> Result<YoloLayer, ConfigError> {
    let all_anchors = spec.anchors(i)?;
    let mask = if spec.has("mask") {
        spec.int_list(i, "mask")?
    } else {
        (0..all_anchors.len() as i64).collect()
    };
    let anchors = mask
        .iter()
        .map(|&m| {
            usize::try_from(m)
                .ok()
                .and_then(|m| all_anchors.get(m).copied())
                .ok_or_else(|| ConfigError::InvalidLayer {
                    layer: i,
                    message: format!("mask index {m} outside {} anchors", all_anchors.len()),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut strides = HEAD_STRIDES;
    if reverse_strides {
        strides.reverse();
    }
    let stride = *strides.get(yolo_index).ok_or_else(|| ConfigError::InvalidLayer {
        layer: i,
        message: format!("at most {} detection heads are supported", HEAD_STRIDES.len()),
    })?;

    let layers = if spec.has("from") {
        resolve_sources(spec.int_list(i, "from")?, i)?
    } else {
        Vec::new()
    };

    let [h, w] = config.image_size;
    Ok(YoloLayer {
        anchors: Ignored(anchors),
        num_classes: spec.usize(i, "classes")?,
        stride,
        index: yolo_index,
        layers: Ignored(layers),
        export_grid: Ignored(config.export.then_some([h / stride, w / stride])),
    })
}

/// Shifts the bias of the convolution feeding a head so training starts with
/// low objectness and uniform class scores. A dropout directly in front of
/// the head is skipped.
pub(crate) fn smart_bias<B: Backend>(
    layers: &mut [Layer<B>],
    mut j: usize,
    head: &YoloLayer,
) -> Result<(), String> {
    if matches!(layers.get(j), Some(Layer::Dropout(_))) {
        j = j.checked_sub(1).ok_or("dropout has no layer in front of it")?;
    }
    let block = layers
        .get_mut(j)
        .and_then(Layer::as_conv_mut)
        .ok_or_else(|| format!("layer {j} is not a convolution"))?;
    let ConvKind::Single(conv) = &mut block.conv else {
        return Err(format!("layer {j} is a multi-kernel convolution"));
    };
    let bias = conv
        .bias
        .as_ref()
        .ok_or_else(|| format!("convolution at layer {j} has no bias"))?
        .val()
        .detach();

    let (na, no) = (head.num_anchors(), head.num_outputs());
    let [filters] = bias.dims();
    if filters < na * no {
        return Err(format!("bias has {filters} entries, head needs {}", na * no));
    }

    let class_prior = (0.6 / (head.num_classes as f64 - 0.99)).ln() as f32;
    let offsets: Vec<f32> = (0..filters)
        .map(|f| match f {
            f if f >= na * no => 0.0,
            f if f % no == 4 => OBJECTNESS_PRIOR,
            f if f % no >= 5 => class_prior,
            _ => 0.0,
        })
        .collect();
    let offsets = Tensor::from_data(TensorData::new(offsets, [filters]), &bias.device());

    conv.bias = Some(Param::from_tensor(bias + offsets));
    Ok(())
}
