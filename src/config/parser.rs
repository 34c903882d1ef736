use std::path::{Path, PathBuf};

use super::layer_spec::{check_supported_fields, CfgValue, LayerKind, LayerSpec};
use crate::error::ConfigError;

/// Parses Darknet `.cfg` text into layer blocks, header first.
pub fn parse_model_config(text: &str, source_name: &str) -> Result<Vec<LayerSpec>, ConfigError> {
    let mut specs: Vec<LayerSpec> = Vec::new();

    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = line_no + 1;

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::Malformed {
                line: line_no,
                message: format!("unterminated block header `{line}`"),
            })?;
            let mut spec = LayerSpec::new(LayerKind::from_name(name.trim()));
            if spec.kind == LayerKind::Convolutional {
                spec.insert("batch_normalize", 0);
            }
            specs.push(spec);
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
            line: line_no,
            message: format!("expected `key=value`, got `{line}`"),
        })?;
        let key = key.trim();
        let value = value.trim();

        let spec = specs.last_mut().ok_or_else(|| ConfigError::Malformed {
            line: line_no,
            message: format!("attribute `{key}` appears before any block"),
        })?;
        spec.insert(key, parse_value(key, value, line_no)?);
    }

    if specs.is_empty() {
        return Err(ConfigError::Empty);
    }

    check_supported_fields(&specs, source_name)?;
    Ok(specs)
}

fn parse_value(key: &str, value: &str, line: usize) -> Result<CfgValue, ConfigError> {
    let bad = |item: &str| ConfigError::Malformed {
        line,
        message: format!("cannot parse `{item}` in `{key}`"),
    };

    if key == "anchors" {
        let numbers = value
            .split(',')
            .map(|v| v.trim().parse::<f32>().map_err(|_| bad(v)))
            .collect::<Result<Vec<_>, _>>()?;
        if numbers.len() % 2 != 0 {
            return Err(ConfigError::Malformed {
                line,
                message: "anchors must come in width,height pairs".to_string(),
            });
        }
        return Ok(CfgValue::Anchors(
            numbers.chunks_exact(2).map(|c| [c[0], c[1]]).collect(),
        ));
    }

    if matches!(key, "from" | "layers" | "mask") || (key == "size" && value.contains(',')) {
        let list = value
            .split(',')
            .map(|v| v.trim().parse::<i64>().map_err(|_| bad(v)))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(CfgValue::IntList(list));
    }

    if let Ok(v) = value.parse::<i64>() {
        Ok(CfgValue::Int(v))
    } else if let Ok(v) = value.parse::<f64>() {
        Ok(CfgValue::Float(v))
    } else {
        Ok(CfgValue::Str(value.to_string()))
    }
}

/// Resolves a configuration name the way the Darknet tooling does: adds a
/// missing `.cfg` suffix and falls back to the `cfg/` directory.
pub fn resolve_config_path(path: impl AsRef<Path>) -> PathBuf {
    let mut path = path.as_ref().to_path_buf();
    if path.extension().and_then(|e| e.to_str()) != Some("cfg") {
        let mut name = path.into_os_string();
        name.push(".cfg");
        path = PathBuf::from(name);
    }
    if !path.exists() {
        let fallback = Path::new("cfg").join(&path);
        if fallback.exists() {
            return fallback;
        }
    }
    path
}

pub fn load_model_config(path: impl AsRef<Path>) -> Result<Vec<LayerSpec>, ConfigError> {
    let path = resolve_config_path(path);
    let text = std::fs::read_to_string(&path)?;
    log::debug!("parsing model config {}", path.display());
    parse_model_config(&text, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = r#"
# comment
[net]
batch=1
width=416

[convolutional]
batch_normalize=1
filters=16
size=3
stride=1
pad=1
activation=leaky

[convolutional]
filters=32
size=3,5,7
stride=1
pad=1
activation=linear

[route]
layers = -1, 0

[yolo]
mask = 0,1
anchors = 10,13,  16,30,  33,23
classes=1
ignore_thresh = .7
"#;

    #[test]
    fn parses_blocks_and_typed_values() {
        let specs = parse_model_config(TINY, "tiny.cfg").unwrap();
        assert_eq!(specs.len(), 5);
        assert_eq!(specs[0].kind, LayerKind::Net);

        assert_eq!(specs[1].int(1, "batch_normalize").unwrap(), 1);
        assert_eq!(specs[1].str_or("activation", "linear"), "leaky");
        // pre-populated for every convolution
        assert_eq!(specs[2].int(2, "batch_normalize").unwrap(), 0);
        assert_eq!(
            specs[2].get("size"),
            Some(&CfgValue::IntList(vec![3, 5, 7]))
        );
        assert_eq!(specs[3].int_list(3, "layers").unwrap(), vec![-1, 0]);
        assert_eq!(specs[4].int_list(4, "mask").unwrap(), vec![0, 1]);
        assert_eq!(
            specs[4].anchors(4).unwrap(),
            vec![[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]]
        );
        assert_eq!(specs[4].float(4, "ignore_thresh").unwrap(), 0.7);
    }

    #[test]
    fn rejects_unsupported_fields() {
        let text = "[net]\n[convolutional]\nfilters=8\ndilation=2\n";
        let err = parse_model_config(text, "bad.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFields { .. }));
    }

    #[test]
    fn rejects_attribute_before_block() {
        let err = parse_model_config("filters=8\n[net]\n", "bad.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1, .. }));
    }

    #[test]
    fn rejects_odd_anchor_count() {
        let text = "[net]\n[yolo]\nanchors=10,13,16\n";
        assert!(parse_model_config(text, "bad.cfg").is_err());
    }
}
