pub mod layer_spec;
pub mod parser;

pub use layer_spec::{check_supported_fields, CfgValue, LayerKind, LayerSpec, SUPPORTED_FIELDS};
pub use parser::{load_model_config, parse_model_config, resolve_config_path};
