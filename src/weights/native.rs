use std::path::Path;

use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder};

use crate::error::WeightsError;
use crate::model::{Darknet, DarknetHeader, DarknetRecord};
use crate::model::layer::LayerRecord;

/// Native checkpoint: training progress, darknet header and model record.
#[derive(Record)]
pub struct NativeCheckpoint<B: Backend> {
    /// `-1` for checkpoints converted from darknet weights.
    pub epoch: i64,
    pub best_map50: Option<f64>,
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    pub seen: i64,
    pub model: DarknetRecord<B>,
    pub ema: Option<DarknetRecord<B>>,
}

/// Progress fields stored alongside the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointInfo {
    pub epoch: i64,
    pub best_map50: Option<f64>,
    pub header: DarknetHeader,
    /// Whether the checkpoint carries EMA parameters.
    pub has_ema: bool,
}

impl Default for CheckpointInfo {
    fn default() -> Self {
        Self {
            epoch: -1,
            best_map50: None,
            header: DarknetHeader::default(),
            has_ema: false,
        }
    }
}

/// Writes `model` and, when given, its EMA copy to a `.bin` checkpoint.
pub fn save_native<B: Backend>(
    model: &Darknet<B>,
    ema: Option<&Darknet<B>>,
    path: impl AsRef<Path>,
    epoch: i64,
    best_map50: Option<f64>,
) -> Result<(), WeightsError> {
    let header = model.header();
    let checkpoint = NativeCheckpoint {
        epoch,
        best_map50,
        major: header.major,
        minor: header.minor,
        revision: header.revision,
        seen: header.seen,
        model: model.clone().into_record(),
        ema: ema.map(|ema| ema.clone().into_record()),
    };

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    recorder.record(checkpoint, path.as_ref().to_path_buf())?;
    log::info!("Saved native checkpoint to {}", path.as_ref().display());
    Ok(())
}

/// Checks a stored graph against `model` layer by layer. Burn loads records
/// without looking at shapes, so this runs before `load_record`.
fn check_record<B: Backend>(model: &Darknet<B>, layers: &[LayerRecord<B>]) -> Result<(), WeightsError> {
    if layers.len() != model.layers.len() {
        return Err(WeightsError::LayerCount {
            expected: model.layers.len(),
            found: layers.len(),
        });
    }
    for (i, (layer, record)) in model.layers.iter().zip(layers).enumerate() {
        if layer.kind() != record.kind() {
            return Err(WeightsError::LayerKind {
                layer: i,
                expected: layer.kind(),
                found: record.kind(),
            });
        }
        let (expected, found) = (layer.parameter_shapes(), record.parameter_shapes());
        if expected != found {
            return Err(WeightsError::ShapeMismatch { layer: i, expected, found });
        }
    }
    Ok(())
}

/// Replaces every parameter of `model` with the checkpoint's and restores
/// the darknet header. A checkpoint written for a different graph is
/// rejected before anything is loaded.
pub fn load_native<B: Backend>(
    model: Darknet<B>,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(Darknet<B>, CheckpointInfo), WeightsError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let checkpoint: NativeCheckpoint<B> = recorder.load(path.as_ref().to_path_buf(), device)?;

    let header = DarknetHeader {
        major: checkpoint.major,
        minor: checkpoint.minor,
        revision: checkpoint.revision,
        seen: checkpoint.seen,
    };
    check_record(&model, &checkpoint.model.layers)?;
    if let Some(ema) = &checkpoint.ema {
        check_record(&model, &ema.layers)?;
    }
    let has_ema = checkpoint.ema.is_some();
    let mut model = model.load_record(checkpoint.model);
    model.set_header(header);

    log::info!(
        "Loaded native checkpoint from {} (epoch {})",
        path.as_ref().display(),
        checkpoint.epoch
    );
    Ok((
        model,
        CheckpointInfo {
            epoch: checkpoint.epoch,
            best_map50: checkpoint.best_map50,
            header,
            has_ema,
        },
    ))
}
