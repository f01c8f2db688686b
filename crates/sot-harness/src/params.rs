use anyhow::{Context, Result};
use sot_core::ParamValue;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub fn params_line(pairs: &[(String, ParamValue)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str("--");
        out.push_str(key);
        out.push('=');
        out.push_str(&value.to_string());
        out.push(' ');
    }
    out
}

#[derive(Debug, Clone)]
pub struct ParamsSchema {
    pub ints: BTreeSet<String>,
    pub floats: BTreeSet<String>,
    pub jsons: BTreeSet<String>,
    pub strings: BTreeSet<String>,
}

fn name_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl Default for ParamsSchema {
    fn default() -> Self {
        ParamsSchema {
            ints: name_set(&[
                "load",
                "feature_blocks",
                "score_upscale",
                "rotations_count",
                "rotation_interpolation",
                "r_pos",
                "iters",
                "batch_size",
                "checkpoint_after_iter",
                "checkpoint_load_iter",
            ]),
            floats: name_set(&[
                "window_influence",
                "context_amount",
                "target_feature_merge_scale",
                "rotation_penalty",
                "rotation_step",
                "lr",
                "threshold",
                "scale",
                "offset_interpolation",
                "vertical_offset_interpolation",
            ]),
            jsons: name_set(&[
                "optimizer_params",
                "lr_schedule_params",
                "target_size",
                "search_size",
                "overwrite_strides",
                "bof_mode",
            ]),
            strings: name_set(&[
                "search_type",
                "target_type",
                "model_config_path",
                "optimizer",
                "lr_schedule",
                "backbone",
                "network_head",
                "temp_path",
                "device",
                "extrapolation_mode",
                "upscaling_mode",
            ]),
        }
    }
}

impl ParamsSchema {
    fn resolve(&self, name: &str, raw: &str) -> ParamValue {
        let trimmed = raw.trim();
        if self.ints.contains(name) {
            if let Ok(i) = trimmed.parse::<i64>() {
                return ParamValue::Int(i);
            }
        } else if self.floats.contains(name) {
            if let Ok(f) = trimmed.parse::<f64>() {
                return ParamValue::Float(f);
            }
        } else if self.jsons.contains(name) {
            if let Ok(v) = serde_json::from_str(trimmed) {
                return ParamValue::Json(v);
            }
        } else if self.strings.contains(name) {
            return ParamValue::Str(trimmed.to_string());
        }
        ParamValue::parse_literal(trimmed)
    }
}

pub fn parse_params_line(line: &str, schema: &ParamsSchema) -> Vec<(String, ParamValue)> {
    let mut values = Vec::new();
    for chunk in line.split("--") {
        let Some((name, raw)) = chunk.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        values.push((name.to_string(), schema.resolve(name, raw)));
    }
    values
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedParams {
    pub config_name: Option<String>,
    pub values: Vec<(String, ParamValue)>,
}

impl ParsedParams {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

// The configuration name is the directory directly under `temp`; without a
// `temp` component the report's parent directory has to do.
pub fn config_name_from_path(path: &Path) -> Option<String> {
    let components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    for (index, component) in components.iter().enumerate() {
        if component == "temp" && index + 2 < components.len() {
            return Some(components[index + 1].clone());
        }
    }
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

pub fn parse_params_file(path: &Path, schema: &ParamsSchema) -> Result<ParsedParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("params_file_unreadable: {}", path.display()))?;
    let mut line = None;
    for candidate in text.lines() {
        if let Some((key, rest)) = candidate.split_once(" = ") {
            if key == "params" {
                line = Some(rest.to_string());
            }
        }
    }
    let values = match line {
        Some(line) => parse_params_line(&line, schema),
        None => Vec::new(),
    };
    Ok(ParsedParams {
        config_name: config_name_from_path(path),
        values,
    })
}
