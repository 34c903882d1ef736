use std::path::Path;

use burn::module::{Param, RunningState};
use burn::nn::conv::Conv2d;
use burn::prelude::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::WeightsError;
use crate::model::blocks::ConvBlock;
use crate::model::{Darknet, DarknetHeader};

/// `major, minor, revision` as i32 plus `seen` as i64.
pub const HEADER_BYTES: usize = 20;

/// Truncated backbone files that only cover a prefix of the graph.
const CUTOFF_FILES: [(&str, usize); 2] = [("darknet53.conv.74", 75), ("yolov3-tiny.conv.15", 15)];

/// Number of leading layers a weights file covers, from its file name.
pub fn cutoff_for(path: impl AsRef<Path>) -> Option<usize> {
    let name = path.as_ref().file_name()?.to_str()?;
    CUTOFF_FILES
        .iter()
        .find(|(file, _)| *file == name)
        .map(|&(_, cutoff)| cutoff)
}

pub fn read_header(bytes: &[u8]) -> Result<(DarknetHeader, &[u8]), WeightsError> {
    if bytes.len() < HEADER_BYTES {
        return Err(WeightsError::TruncatedHeader(bytes.len()));
    }
    let mut reader = bytes;
    let header = DarknetHeader {
        major: reader.read_i32::<LittleEndian>()?,
        minor: reader.read_i32::<LittleEndian>()?,
        revision: reader.read_i32::<LittleEndian>()?,
        seen: reader.read_i64::<LittleEndian>()?,
    };
    Ok((header, reader))
}

fn write_header(header: &DarknetHeader, out: &mut Vec<u8>) -> Result<(), WeightsError> {
    out.write_i32::<LittleEndian>(header.major)?;
    out.write_i32::<LittleEndian>(header.minor)?;
    out.write_i32::<LittleEndian>(header.revision)?;
    out.write_i64::<LittleEndian>(header.seen)?;
    Ok(())
}

/// Floats one convolutional block occupies in the stream.
fn block_len<B: Backend>(block: &ConvBlock<B>) -> usize {
    let weights: usize = block
        .conv
        .branches()
        .iter()
        .map(|conv| conv.weight.dims().iter().product::<usize>())
        .sum();
    match &block.norm {
        Some(bn) => 4 * bn.gamma.dims()[0] + weights,
        None => {
            let biases: usize = block
                .conv
                .branches()
                .iter()
                .filter_map(|conv| conv.bias.as_ref())
                .map(|bias| bias.dims()[0])
                .sum();
            biases + weights
        }
    }
}

struct FloatStream<'a> {
    values: &'a [f32],
    offset: usize,
}

impl<'a> FloatStream<'a> {
    fn take(&mut self, layer: usize, n: usize) -> Result<&'a [f32], WeightsError> {
        let available = self.values.len() - self.offset;
        if n > available {
            return Err(WeightsError::TruncatedStream {
                layer,
                needed: n,
                available,
            });
        }
        let chunk = &self.values[self.offset..self.offset + n];
        self.offset += n;
        Ok(chunk)
    }

    fn vector<B: Backend>(&mut self, layer: usize, n: usize, device: &B::Device) -> Result<Tensor<B, 1>, WeightsError> {
        let values = self.take(layer, n)?.to_vec();
        Ok(Tensor::from_data(TensorData::new(values, [n]), device))
    }
}

fn load_block<B: Backend>(block: &mut ConvBlock<B>, layer: usize, stream: &mut FloatStream) -> Result<(), WeightsError> {
    let has_norm = block.norm.is_some();
    if let Some(bn) = block.norm.as_mut() {
        let n = bn.gamma.dims()[0];
        let device = bn.gamma.device();
        bn.beta = Param::from_tensor(stream.vector(layer, n, &device)?);
        bn.gamma = Param::from_tensor(stream.vector(layer, n, &device)?);
        bn.running_mean = RunningState::new(stream.vector(layer, n, &device)?);
        bn.running_var = RunningState::new(stream.vector(layer, n, &device)?);
    }

    for conv in block.conv.branches_mut() {
        let device = conv.weight.device();
        if !has_norm {
            if let Some(bias) = conv.bias.as_mut() {
                let n = bias.dims()[0];
                *bias = Param::from_tensor(stream.vector(layer, n, &device)?);
            }
        }
        let dims = conv.weight.dims();
        let values = stream.take(layer, dims.iter().product())?.to_vec();
        conv.weight = Param::from_tensor(Tensor::from_data(TensorData::new(values, dims), &device));
    }
    Ok(())
}

/// Loads a darknet `.weights` byte stream into the first `cutoff` layers.
///
/// The stream length is checked against every block before any parameter
/// is replaced, so a short file leaves the model untouched. Floats past the
/// cutoff are ignored.
pub fn load_darknet_weights<B: Backend>(
    model: &mut Darknet<B>,
    bytes: &[u8],
    cutoff: Option<usize>,
) -> Result<DarknetHeader, WeightsError> {
    let (header, payload) = read_header(bytes)?;
    if payload.len() % 4 != 0 {
        return Err(WeightsError::MisalignedPayload(payload.len()));
    }
    let mut values = vec![0f32; payload.len() / 4];
    let mut reader = payload;
    reader.read_f32_into::<LittleEndian>(&mut values)?;

    let cutoff = cutoff.unwrap_or(model.layers.len()).min(model.layers.len());
    let mut needed = 0;
    for (i, layer) in model.layers[..cutoff].iter().enumerate() {
        if let Some(block) = layer.as_conv() {
            let n = block_len(block);
            if needed + n > values.len() {
                return Err(WeightsError::TruncatedStream {
                    layer: i,
                    needed: n,
                    available: values.len() - needed,
                });
            }
            needed += n;
        }
    }

    let mut stream = FloatStream {
        values: &values,
        offset: 0,
    };
    for (i, layer) in model.layers[..cutoff].iter_mut().enumerate() {
        if let Some(block) = layer.as_conv_mut() {
            load_block(block, i, &mut stream)?;
        }
    }
    model.set_header(header);

    log::info!(
        "Loaded {} darknet parameters into {} layers (version {}.{}.{}, {} images seen)",
        needed,
        cutoff,
        header.major,
        header.minor,
        header.revision,
        header.seen
    );
    if values.len() > needed {
        log::debug!("{} trailing floats ignored", values.len() - needed);
    }
    Ok(header)
}

/// Reads a `.weights` file, taking the cutoff from well-known backbone file
/// names.
pub fn load_darknet_file<B: Backend>(model: &mut Darknet<B>, path: impl AsRef<Path>) -> Result<DarknetHeader, WeightsError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    load_darknet_weights(model, &bytes, cutoff_for(path))
}

fn push_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>, out: &mut Vec<u8>) -> Result<(), WeightsError> {
    let values: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .into_vec()
        .map_err(|e| WeightsError::TensorData(format!("{e:?}")))?;
    for v in values {
        out.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn push_conv<B: Backend>(conv: &Conv2d<B>, with_bias: bool, out: &mut Vec<u8>) -> Result<(), WeightsError> {
    if with_bias {
        if let Some(bias) = &conv.bias {
            push_tensor(bias.val(), out)?;
        }
    }
    push_tensor(conv.weight.val(), out)
}

/// Serializes the first `cutoff` layers in darknet order.
pub fn save_darknet_weights<B: Backend>(model: &Darknet<B>, cutoff: Option<usize>) -> Result<Vec<u8>, WeightsError> {
    let cutoff = cutoff.unwrap_or(model.layers.len()).min(model.layers.len());
    let mut out = Vec::new();
    write_header(&model.header(), &mut out)?;

    for layer in &model.layers[..cutoff] {
        let Some(block) = layer.as_conv() else {
            continue;
        };
        match &block.norm {
            Some(bn) => {
                push_tensor(bn.beta.val(), &mut out)?;
                push_tensor(bn.gamma.val(), &mut out)?;
                push_tensor(bn.running_mean.value(), &mut out)?;
                push_tensor(bn.running_var.value(), &mut out)?;
                for conv in block.conv.branches() {
                    push_conv(conv, false, &mut out)?;
                }
            }
            None => {
                for conv in block.conv.branches() {
                    push_conv(conv, true, &mut out)?;
                }
            }
        }
    }
    Ok(out)
}

pub fn save_darknet_file<B: Backend>(
    model: &Darknet<B>,
    path: impl AsRef<Path>,
    cutoff: Option<usize>,
) -> Result<(), WeightsError> {
    let bytes = save_darknet_weights(model, cutoff)?;
    std::fs::write(path.as_ref(), &bytes)?;
    log::info!("Saved {} bytes of darknet weights to {}", bytes.len(), path.as_ref().display());
    Ok(())
}
