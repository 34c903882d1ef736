use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Every attribute a layer block may carry. Anything else aborts graph
/// construction because the layer indices downstream would no longer line up.
pub const SUPPORTED_FIELDS: [&str; 30] = [
    "type",
    "batch_normalize",
    "filters",
    "size",
    "stride",
    "pad",
    "activation",
    "layers",
    "groups",
    "from",
    "mask",
    "anchors",
    "classes",
    "num",
    "jitter",
    "ignore_thresh",
    "truth_thresh",
    "random",
    "stride_x",
    "stride_y",
    "weights_type",
    "weights_normalization",
    "scale_x_y",
    "beta_nms",
    "nms_kind",
    "iou_loss",
    "iou_normalizer",
    "cls_normalizer",
    "iou_thresh",
    "probability",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Net,
    Convolutional,
    BatchNorm,
    MaxPool,
    Upsample,
    Route,
    Shortcut,
    Reorg3d,
    Yolo,
    Dropout,
    Other(String),
}

impl LayerKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "net" | "network" => Self::Net,
            "convolutional" => Self::Convolutional,
            "batchnorm" | "BatchNorm2d" => Self::BatchNorm,
            "maxpool" => Self::MaxPool,
            "upsample" => Self::Upsample,
            "route" => Self::Route,
            "shortcut" => Self::Shortcut,
            "reorg3d" => Self::Reorg3d,
            "yolo" => Self::Yolo,
            "dropout" => Self::Dropout,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Net => "net",
            Self::Convolutional => "convolutional",
            Self::BatchNorm => "batchnorm",
            Self::MaxPool => "maxpool",
            Self::Upsample => "upsample",
            Self::Route => "route",
            Self::Shortcut => "shortcut",
            Self::Reorg3d => "reorg3d",
            Self::Yolo => "yolo",
            Self::Dropout => "dropout",
            Self::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CfgValue {
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    Anchors(Vec<[f32; 2]>),
}

impl From<i32> for CfgValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<i64> for CfgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for CfgValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for CfgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for CfgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<Vec<i64>> for CfgValue {
    fn from(value: Vec<i64>) -> Self {
        Self::IntList(value)
    }
}

impl From<Vec<[f32; 2]>> for CfgValue {
    fn from(value: Vec<[f32; 2]>) -> Self {
        Self::Anchors(value)
    }
}

/// One `[block]` of a Darknet configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    fields: BTreeMap<String, CfgValue>,
}

impl LayerSpec {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<CfgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<CfgValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&CfgValue> {
        self.fields.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn missing(&self, layer: usize, key: &str) -> ConfigError {
        ConfigError::MissingField {
            layer,
            kind: self.kind.name().to_string(),
            field: key.to_string(),
        }
    }

    fn invalid(layer: usize, key: &str, expected: &'static str) -> ConfigError {
        ConfigError::InvalidValue {
            layer,
            field: key.to_string(),
            expected,
        }
    }

    pub fn int(&self, layer: usize, key: &str) -> Result<i64, ConfigError> {
        match self.get(key) {
            Some(CfgValue::Int(v)) => Ok(*v),
            Some(CfgValue::Float(v)) if v.fract() == 0.0 => Ok(*v as i64),
            Some(CfgValue::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| Self::invalid(layer, key, "an integer")),
            Some(_) => Err(Self::invalid(layer, key, "an integer")),
            None => Err(self.missing(layer, key)),
        }
    }

    pub fn int_or(&self, layer: usize, key: &str, default: i64) -> Result<i64, ConfigError> {
        if self.has(key) {
            self.int(layer, key)
        } else {
            Ok(default)
        }
    }

    pub fn usize(&self, layer: usize, key: &str) -> Result<usize, ConfigError> {
        let value = self.int(layer, key)?;
        usize::try_from(value).map_err(|_| Self::invalid(layer, key, "a non-negative integer"))
    }

    pub fn float(&self, layer: usize, key: &str) -> Result<f64, ConfigError> {
        match self.get(key) {
            Some(CfgValue::Int(v)) => Ok(*v as f64),
            Some(CfgValue::Float(v)) => Ok(*v),
            Some(CfgValue::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Self::invalid(layer, key, "a number")),
            Some(_) => Err(Self::invalid(layer, key, "a number")),
            None => Err(self.missing(layer, key)),
        }
    }

    /// String attribute, falling back to `default` when absent.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            Some(CfgValue::Str(s)) => s.as_str(),
            _ => default,
        }
    }

    /// Integer list attribute. A single integer is read as a one-element list.
    pub fn int_list(&self, layer: usize, key: &str) -> Result<Vec<i64>, ConfigError> {
        match self.get(key) {
            Some(CfgValue::IntList(v)) => Ok(v.clone()),
            Some(CfgValue::Int(v)) => Ok(vec![*v]),
            Some(_) => Err(Self::invalid(layer, key, "a list of integers")),
            None => Err(self.missing(layer, key)),
        }
    }

    pub fn anchors(&self, layer: usize) -> Result<Vec<[f32; 2]>, ConfigError> {
        match self.get("anchors") {
            Some(CfgValue::Anchors(v)) => Ok(v.clone()),
            Some(_) => Err(Self::invalid(layer, "anchors", "a list of width,height pairs")),
            None => Err(self.missing(layer, "anchors")),
        }
    }
}

/// Rejects any block (after the `[net]` header) carrying a field outside
/// [`SUPPORTED_FIELDS`].
pub fn check_supported_fields(specs: &[LayerSpec], source_name: &str) -> Result<(), ConfigError> {
    let mut unsupported: Vec<String> = Vec::new();
    for spec in specs.iter().skip(1) {
        for name in spec.field_names() {
            if !SUPPORTED_FIELDS.contains(&name) && !unsupported.iter().any(|u| u == name) {
                unsupported.push(name.to_string());
            }
        }
    }

    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedFields {
            source_name: source_name.to_string(),
            fields: unsupported,
        })
    }
}
