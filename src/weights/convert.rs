use std::path::{Path, PathBuf};

use burn::prelude::*;

use super::darknet::{load_darknet_file, save_darknet_file};
use super::native::{load_native, save_native};
use crate::error::{Result, WeightsError};
use crate::model::{Darknet, DarknetConfig};

/// Converts between darknet `.weights` and native `.bin` checkpoints.
///
/// The model is built from `cfg`, the weights are loaded in their own
/// format and written next to the input with the other extension. Returns
/// the written path.
pub fn convert<B: Backend>(
    cfg: impl AsRef<Path>,
    weights: impl AsRef<Path>,
    config: &DarknetConfig,
    device: &B::Device,
) -> Result<PathBuf> {
    let weights = weights.as_ref();
    let mut model = Darknet::<B>::from_cfg_file(cfg, config, device)?;

    match weights.extension().and_then(|ext| ext.to_str()) {
        Some("weights") => {
            load_darknet_file(&mut model, weights)?;
            let target = weights.with_extension("bin");
            // converted weights seed the EMA as well
            save_native(&model, Some(&model), &target, -1, None)?;
            log::info!("Success: converted '{}' to '{}'", weights.display(), target.display());
            Ok(target)
        }
        Some("bin") => {
            let (model, _) = load_native(model, weights, device)?;
            let target = weights.with_extension("weights");
            save_darknet_file(&model, &target, None)?;
            log::info!("Success: converted '{}' to '{}'", weights.display(), target.display());
            Ok(target)
        }
        _ => Err(WeightsError::UnsupportedExtension(weights.display().to_string()).into()),
    }
}
