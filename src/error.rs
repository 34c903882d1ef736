use thiserror::Error;

/// Problems found while reading a `.cfg` file or assembling the layer graph.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported fields {fields:?} in {source_name}")]
    UnsupportedFields { source_name: String, fields: Vec<String> },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("layer {layer} ({kind}): missing field `{field}`")]
    MissingField { layer: usize, kind: String, field: String },

    #[error("layer {layer}: field `{field}` has the wrong type, expected {expected}")]
    InvalidValue { layer: usize, field: String, expected: &'static str },

    #[error("layer {layer} references layer {target}, which is not an earlier layer")]
    InvalidReference { layer: usize, target: i64 },

    #[error("layer {layer}: {message}")]
    InvalidLayer { layer: usize, message: String },

    #[error("configuration contains no layers after the [net] header")]
    Empty,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ground-truth records that cannot be matched against the model.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error(
        "model accepts {num_classes} classes labeled from 0-{}, however a target is labeled {class_id}",
        num_classes.saturating_sub(1)
    )]
    ClassOutOfRange { class_id: usize, num_classes: usize },

    #[error("got {predictions} prediction tensors for {heads} detection heads")]
    HeadCountMismatch { predictions: usize, heads: usize },
}

/// Failures while reading or writing weight files.
#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("weights file is truncated: header needs 20 bytes, got {0}")]
    TruncatedHeader(usize),

    #[error("weights stream ended at layer {layer}: needed {needed} floats, {available} left")]
    TruncatedStream { layer: usize, needed: usize, available: usize },

    #[error("weights payload is {0} bytes, not a whole number of f32 values")]
    MisalignedPayload(usize),

    #[error("could not read parameter values: {0}")]
    TensorData(String),

    #[error("checkpoint holds {found} layers, the model has {expected}")]
    LayerCount { expected: usize, found: usize },

    #[error("layer {layer}: checkpoint holds a {found} layer, the model a {expected} layer")]
    LayerKind { layer: usize, expected: &'static str, found: &'static str },

    #[error("layer {layer}: checkpoint parameter shapes {found:?} do not match the model's {expected:?}")]
    ShapeMismatch { layer: usize, expected: Vec<Vec<usize>>, found: Vec<Vec<usize>> },

    #[error("unsupported weights extension for {0} (expected .weights or .bin)")]
    UnsupportedExtension(String),

    #[error("checkpoint record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Weights(#[from] WeightsError),
}

pub type Result<T> = std::result::Result<T, Error>;
