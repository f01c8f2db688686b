use crate::grid::{Candidate, ConfigKey, GridParam, ParameterGrid, SweepConfig};
use crate::params::ParsedParams;
use crate::realtime::RealtimeOptions;
use crate::sweep::{LoadSpec, SweepJob};
use crate::HarnessError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sot_core::ParamValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn default_train_steps() -> i64 {
    200_000
}

fn default_save_step() -> i64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainPlan {
    #[serde(default = "default_train_steps")]
    pub train_steps: i64,
    #[serde(default = "default_save_step")]
    pub save_step: i64,
}

impl Default for TrainPlan {
    fn default() -> Self {
        TrainPlan {
            train_steps: default_train_steps(),
            save_step: default_save_step(),
        }
    }
}

impl TrainPlan {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.train_steps <= 0 {
            return Err(HarnessError::configuration(format!(
                "train_steps must be positive, got {}",
                self.train_steps
            )));
        }
        if self.save_step <= 0 {
            return Err(HarnessError::configuration(format!(
                "save_step must be positive, got {}",
                self.save_step
            )));
        }
        if self.save_step > self.train_steps {
            return Err(HarnessError::configuration(format!(
                "save_step {} exceeds train_steps {}",
                self.save_step, self.train_steps
            )));
        }
        Ok(())
    }

    pub fn final_step(&self) -> i64 {
        self.train_steps - self.train_steps % self.save_step
    }
}

fn default_eval_id() -> String {
    "default".to_string()
}

fn default_classes() -> Vec<String> {
    vec!["Car".to_string(), "Van".to_string(), "Truck".to_string()]
}

fn default_near_distance() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalOptions {
    #[serde(default = "default_eval_id")]
    pub eval_id: String,
    #[serde(default)]
    pub iou_min: f64,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_near_distance")]
    pub near_distance: f64,
    #[serde(default)]
    pub raise_on_infer_error: bool,
    #[serde(default)]
    pub limit_object_ids: bool,
    #[serde(default)]
    pub tracks: Option<Vec<String>>,
    #[serde(default)]
    pub realtime: Option<RealtimeOptions>,
    #[serde(default)]
    pub overrides: BTreeMap<String, ParamValue>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            eval_id: default_eval_id(),
            iou_min: 0.0,
            classes: default_classes(),
            near_distance: default_near_distance(),
            raise_on_infer_error: false,
            limit_object_ids: false,
            tracks: None,
            realtime: None,
            overrides: BTreeMap::new(),
        }
    }
}

// Report options recognized by name when absorbing a params file; anything
// else becomes a tracker-parameter override.
const RESERVED_PARAMS: &[&str] = &[
    "model_name",
    "load",
    "draw",
    "iou_min",
    "classes",
    "tracks",
    "device",
    "eval_id",
    "near_distance",
    "backbone",
    "raise_on_infer_error",
    "limit_object_ids",
];

fn string_list(value: &ParamValue) -> Option<Vec<String>> {
    match value {
        ParamValue::Json(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        ParamValue::Str(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

impl EvalOptions {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.eval_id.is_empty() || self.eval_id.contains('/') {
            return Err(HarnessError::configuration(format!(
                "eval_id must be a non-empty path fragment, got '{}'",
                self.eval_id
            )));
        }
        Ok(())
    }

    pub fn override_pairs(&self) -> Vec<(String, ParamValue)> {
        self.overrides
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    // Values from a previously written report win over the current field
    // values; unknown keys become overrides unless one is already set.
    pub fn absorb_params(&mut self, params: &ParsedParams) -> Result<(), HarnessError> {
        for (name, value) in &params.values {
            match name.as_str() {
                "iou_min" => {
                    self.iou_min = value.as_f64().ok_or_else(|| {
                        HarnessError::configuration(format!("iou_min is not numeric: {}", value))
                    })?;
                }
                "near_distance" => {
                    self.near_distance = value.as_f64().ok_or_else(|| {
                        HarnessError::configuration(format!(
                            "near_distance is not numeric: {}",
                            value
                        ))
                    })?;
                }
                "eval_id" => {
                    self.eval_id = value.to_string();
                }
                "raise_on_infer_error" => {
                    self.raise_on_infer_error = value.as_bool().ok_or_else(|| {
                        HarnessError::configuration(format!(
                            "raise_on_infer_error is not a bool: {}",
                            value
                        ))
                    })?;
                }
                "limit_object_ids" => {
                    self.limit_object_ids = value.as_bool().ok_or_else(|| {
                        HarnessError::configuration(format!(
                            "limit_object_ids is not a bool: {}",
                            value
                        ))
                    })?;
                }
                "classes" => {
                    self.classes = string_list(value).ok_or_else(|| {
                        HarnessError::configuration(format!(
                            "classes is not a string list: {}",
                            value
                        ))
                    })?;
                }
                "tracks" => {
                    self.tracks = Some(string_list(value).ok_or_else(|| {
                        HarnessError::configuration(format!(
                            "tracks is not a string list: {}",
                            value
                        ))
                    })?);
                }
                other if RESERVED_PARAMS.contains(&other) => {}
                other => {
                    if !self.overrides.contains_key(other) {
                        self.overrides.insert(other.to_string(), value.clone());
                    }
                }
            }
        }
        self.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidateSpec {
    Tagged { value: ParamValue, short: String },
    Plain(ParamValue),
}

impl CandidateSpec {
    fn to_candidate(&self) -> Candidate {
        match self {
            CandidateSpec::Tagged { value, short } => Candidate::tagged(value.clone(), short),
            CandidateSpec::Plain(value) => Candidate::plain(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridParamSpec {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub values: Vec<CandidateSpec>,
}

fn default_results_root() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_loads() -> Vec<LoadSpec> {
    vec![LoadSpec::Value(-1.0)]
}

fn default_evals() -> Vec<EvalOptions> {
    vec![EvalOptions::default()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    #[serde(default)]
    pub base: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub grid: Vec<GridParamSpec>,
    #[serde(default)]
    pub train: TrainPlan,
    #[serde(default = "default_loads")]
    pub loads: Vec<LoadSpec>,
    #[serde(default = "default_evals")]
    pub evals: Vec<EvalOptions>,
}

impl SweepFile {
    pub fn grid(&self) -> ParameterGrid {
        let mut grid = ParameterGrid::new();
        for spec in &self.grid {
            let tag = spec.tag.as_deref().unwrap_or(&spec.name);
            let candidates = spec.values.iter().map(|v| v.to_candidate()).collect();
            grid.push(GridParam::new(&spec.name, tag, candidates));
        }
        grid
    }

    fn base_pairs(&self) -> Vec<(String, ParamValue)> {
        self.base
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn configs(&self) -> Result<Vec<SweepConfig>, HarnessError> {
        let base = ConfigKey::from_pairs(self.base_pairs());
        if self.grid.is_empty() {
            return Ok(vec![SweepConfig {
                key: base,
                name: self.name.clone().unwrap_or_else(|| "base".to_string()),
            }]);
        }
        let mut configs = Vec::new();
        for built in self.grid().build()? {
            let name = match &self.name {
                Some(prefix) => format!("{}-{}", prefix, built.name),
                None => built.name.clone(),
            };
            configs.push(SweepConfig {
                key: base.with_overrides(built.key.pairs()),
                name,
            });
        }
        Ok(configs)
    }

    pub fn jobs(&self) -> Result<Vec<SweepJob>, HarnessError> {
        self.train.validate()?;
        if self.loads.is_empty() {
            return Err(HarnessError::configuration("no checkpoint loads requested"));
        }
        if self.evals.is_empty() {
            return Err(HarnessError::configuration("no evaluations requested"));
        }
        for eval in &self.evals {
            eval.validate()?;
        }
        let jobs = self
            .configs()?
            .into_iter()
            .map(|config| SweepJob {
                config,
                train: self.train.clone(),
                loads: self.loads.clone(),
                evals: self.evals.clone(),
            })
            .collect();
        Ok(jobs)
    }
}

pub fn load_sweep_file(path: &Path) -> Result<SweepFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("sweep_file_read: {}", path.display()))?;
    let file: SweepFile = serde_yaml::from_str(&text)
        .with_context(|| format!("sweep_file_parse: {}", path.display()))?;
    Ok(file)
}
