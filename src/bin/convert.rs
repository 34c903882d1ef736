use anyhow::Context;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use clap::Parser;

use yolov3_detection::model::DarknetConfig;
use yolov3_detection::weights::convert;

type BackendType = NdArray;

/// Convert darknet .weights to native .bin checkpoints and back.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model configuration (.cfg)
    #[arg(short, long, default_value = "cfg/yolov3-spp.cfg")]
    cfg: String,

    /// Weights to convert (.weights or .bin)
    #[arg(short, long)]
    weights: String,

    /// Input size the model is built for
    #[arg(long, default_value_t = 416)]
    img_size: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let device = NdArrayDevice::default();
    let config = DarknetConfig {
        image_size: [args.img_size, args.img_size],
        ..DarknetConfig::default()
    };

    let target = convert::<BackendType>(&args.cfg, &args.weights, &config, &device)
        .with_context(|| format!("converting {} with {}", args.weights, args.cfg))?;
    println!("{}", target.display());
    Ok(())
}
