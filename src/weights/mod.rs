pub mod convert;
pub mod darknet;
pub mod native;

pub use convert::convert;
pub use darknet::{
    cutoff_for, load_darknet_file, load_darknet_weights, read_header, save_darknet_file, save_darknet_weights,
};
pub use native::{load_native, save_native, CheckpointInfo, NativeCheckpoint};
