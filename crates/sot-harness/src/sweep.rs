use crate::config::{EvalOptions, TrainPlan};
use crate::evaluate::{evaluate_tracks, evaluate_tracks_realtime};
use crate::grid::SweepConfig;
use crate::learner::{checkpoint_file, Learner, LearnerProvider, TrackProvider};
use crate::report::{write_report, ResultRecord};
use crate::HarnessError;
use anyhow::{Context, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sot_core::ParamValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub worker_id: usize,
    pub worker_count: usize,
    pub stride_group_size: usize,
}

impl ShardPlan {
    pub fn new(
        worker_id: usize,
        worker_count: usize,
        stride_group_size: usize,
    ) -> Result<Self, HarnessError> {
        if worker_count == 0 {
            return Err(HarnessError::configuration("worker_count must be positive"));
        }
        if stride_group_size == 0 {
            return Err(HarnessError::configuration(
                "stride_group_size must be positive",
            ));
        }
        let stride = worker_count * stride_group_size;
        if worker_id >= stride {
            return Err(HarnessError::configuration(format!(
                "worker_id {} does not fit a stride of {}",
                worker_id, stride
            )));
        }
        Ok(ShardPlan {
            worker_id,
            worker_count,
            stride_group_size,
        })
    }

    pub fn solo() -> Self {
        ShardPlan {
            worker_id: 0,
            worker_count: 1,
            stride_group_size: 1,
        }
    }

    pub fn stride(&self) -> usize {
        self.worker_count * self.stride_group_size
    }

    // Oversubscribed logical workers share physical devices round-robin.
    pub fn device_index(&self) -> usize {
        self.worker_id % self.worker_count
    }

    pub fn owned_indices(&self, len: usize) -> Vec<usize> {
        (self.worker_id..len).step_by(self.stride()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadSpec {
    Latest,
    Pretrained,
    Value(f64),
}

impl Serialize for LoadSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LoadSpec::Latest => serializer.serialize_str("latest"),
            LoadSpec::Pretrained => serializer.serialize_str("pretrained"),
            LoadSpec::Value(value) => {
                if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                    serializer.serialize_i64(*value as i64)
                } else {
                    serializer.serialize_f64(*value)
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for LoadSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LoadVisitor;

        impl<'de> Visitor<'de> for LoadVisitor {
            type Value = LoadSpec;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a step count, \"latest\", or \"pretrained\"")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<LoadSpec, E> {
                Ok(LoadSpec::Value(value as f64))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<LoadSpec, E> {
                Ok(LoadSpec::Value(value as f64))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<LoadSpec, E> {
                Ok(LoadSpec::Value(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<LoadSpec, E> {
                match value {
                    "latest" => Ok(LoadSpec::Latest),
                    "pretrained" => Ok(LoadSpec::Pretrained),
                    other => Err(E::custom(format!("unknown load: {}", other))),
                }
            }
        }

        deserializer.deserialize_any(LoadVisitor)
    }
}

pub fn resolve_load_steps(load: f64, plan: &TrainPlan) -> Result<i64, HarnessError> {
    let train_steps = plan.train_steps as f64;
    let mut load = load;
    if load.abs() < plan.save_step as f64 {
        load *= train_steps;
    }
    if load == -train_steps {
        load = train_steps;
    }
    if load < 0.0 {
        load += train_steps;
    }
    let mut steps = load as i64;
    steps -= steps % plan.save_step;
    if steps <= 0 || steps > plan.train_steps {
        return Err(HarnessError::configuration(format!(
            "load resolves to step {} outside 1..={}",
            steps, plan.train_steps
        )));
    }
    Ok(steps)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedLoad {
    Latest,
    Pretrained,
    Steps(i64),
}

impl ResolvedLoad {
    // "0" keeps report filenames aligned with the load-latest convention.
    pub fn label(&self) -> String {
        match self {
            ResolvedLoad::Latest => "0".to_string(),
            ResolvedLoad::Pretrained => "pretrained".to_string(),
            ResolvedLoad::Steps(steps) => steps.to_string(),
        }
    }
}

pub fn resolve_load(spec: &LoadSpec, plan: &TrainPlan) -> Result<ResolvedLoad, HarnessError> {
    match spec {
        LoadSpec::Latest => Ok(ResolvedLoad::Latest),
        LoadSpec::Pretrained => Ok(ResolvedLoad::Pretrained),
        LoadSpec::Value(value) => Ok(ResolvedLoad::Steps(resolve_load_steps(*value, plan)?)),
    }
}

pub fn checkpoint_dir(results_root: &Path, config_name: &str) -> PathBuf {
    results_root.join(config_name).join("checkpoints")
}

pub fn results_file(
    results_root: &Path,
    config_name: &str,
    load_label: &str,
    eval_id: &str,
) -> PathBuf {
    results_root
        .join(config_name)
        .join(format!("results_{}_{}.txt", load_label, eval_id))
}

#[derive(Debug, Clone)]
pub struct SweepJob {
    pub config: SweepConfig,
    pub train: TrainPlan,
    pub loads: Vec<LoadSpec>,
    pub evals: Vec<EvalOptions>,
}

#[derive(Debug, Default)]
pub struct ResultRegistry {
    records: BTreeMap<String, BTreeMap<String, ResultRecord>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        ResultRegistry::default()
    }

    pub fn register(
        &mut self,
        config_name: &str,
        result_key: &str,
        record: ResultRecord,
    ) -> Result<(), HarnessError> {
        let slot = self.records.entry(config_name.to_string()).or_default();
        if slot.contains_key(result_key) {
            return Err(HarnessError::configuration(format!(
                "duplicate result {} for configuration {}",
                result_key, config_name
            )));
        }
        slot.insert(result_key.to_string(), record);
        Ok(())
    }

    pub fn get(&self, config_name: &str, result_key: &str) -> Option<&ResultRecord> {
        self.records.get(config_name)?.get(result_key)
    }

    pub fn config_names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    pub fn drain(&mut self) -> Vec<(String, String, ResultRecord)> {
        std::mem::take(&mut self.records)
            .into_iter()
            .flat_map(|(name, slot)| {
                slot.into_iter()
                    .map(move |(key, record)| (name.clone(), key, record))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SweepContext<'a> {
    pub learners: &'a dyn LearnerProvider,
    pub tracks: &'a dyn TrackProvider,
    pub results_root: PathBuf,
    pub devices: Vec<String>,
    pub pretrained: Option<PathBuf>,
    pub keep_going: bool,
}

pub fn device_for(plan: &ShardPlan, devices: &[String]) -> String {
    if devices.is_empty() {
        "cpu".to_string()
    } else {
        devices[plan.device_index() % devices.len()].clone()
    }
}

fn eval_params(config: &SweepConfig, load_label: &str) -> Vec<(String, ParamValue)> {
    let mut params = Vec::new();
    if let Some(backbone) = config.value("backbone") {
        params.push(("backbone".to_string(), backbone.clone()));
    }
    let load_value = load_label
        .parse::<i64>()
        .map(ParamValue::Int)
        .unwrap_or_else(|_| ParamValue::Str(load_label.to_string()));
    params.push(("load".to_string(), load_value));
    for (name, value) in config.key.pairs() {
        if name != "backbone" {
            params.push((name.clone(), value.clone()));
        }
    }
    params
}

fn apply_load(
    learner: &mut dyn Learner,
    load: &ResolvedLoad,
    checkpoints: &Path,
    pretrained: Option<&Path>,
) -> Result<()> {
    match load {
        ResolvedLoad::Latest => learner.load_latest(checkpoints),
        ResolvedLoad::Steps(steps) => learner.load_from_checkpoint(checkpoints, *steps),
        ResolvedLoad::Pretrained => {
            let path = pretrained
                .ok_or_else(|| HarnessError::configuration("no pretrained path configured"))?;
            learner.load_pretrained(path)
        }
    }
}

fn ensure_trained(
    job: &SweepJob,
    device: &str,
    checkpoints: &Path,
    context: &SweepContext<'_>,
) -> Result<()> {
    let final_step = job.train.final_step();
    let marker = checkpoint_file(checkpoints, final_step);
    if marker.is_file() {
        info!(config = %job.config.name, final_step, "checkpoint present, skipping training");
        return Ok(());
    }
    let ids = context.tracks.track_ids();
    let first = ids
        .first()
        .ok_or_else(|| HarnessError::configuration("no tracks available for training"))?;
    let dataset = context.tracks.track(first)?;
    let mut learner = context.learners.create(&job.config, device)?;
    info!(config = %job.config.name, track = %first, final_step, "training");
    learner.fit(dataset.as_ref(), &job.train, checkpoints)
}

fn run_eval(
    job: &SweepJob,
    resolved: &ResolvedLoad,
    eval: &EvalOptions,
    device: &str,
    checkpoints: &Path,
    context: &SweepContext<'_>,
    registry: &mut ResultRegistry,
) -> Result<()> {
    let merged = job.config.with_overrides(&eval.override_pairs());
    let mut learner = context.learners.create(&merged, device)?;
    apply_load(
        learner.as_mut(),
        resolved,
        checkpoints,
        context.pretrained.as_deref(),
    )?;
    let label = resolved.label();
    let params = eval_params(&merged, &label);
    let record = if eval.realtime.is_some() {
        evaluate_tracks_realtime(learner.as_mut(), context.tracks, eval, &params)?
    } else {
        evaluate_tracks(learner.as_mut(), context.tracks, eval, &params)?
    };
    let path = results_file(&context.results_root, &job.config.name, &label, &eval.eval_id);
    write_report(&path, &record)?;
    let result_key = format!("{}_{}", label, eval.eval_id);
    info!(config = %job.config.name, key = %result_key, file = %path.display(), "evaluation recorded");
    registry.register(&job.config.name, &result_key, record)?;
    Ok(())
}

fn run_job(
    job: &SweepJob,
    device: &str,
    context: &SweepContext<'_>,
    registry: &mut ResultRegistry,
) -> Result<()> {
    job.train.validate()?;
    let checkpoints = checkpoint_dir(&context.results_root, &job.config.name);
    ensure_trained(job, device, &checkpoints, context)?;
    for load in &job.loads {
        let resolved = resolve_load(load, &job.train)?;
        for eval in &job.evals {
            run_eval(job, &resolved, eval, device, &checkpoints, context, registry)?;
        }
    }
    Ok(())
}

pub fn run_sweep(
    jobs: &[SweepJob],
    plan: &ShardPlan,
    context: &SweepContext<'_>,
) -> Result<ResultRegistry> {
    let owned = plan.owned_indices(jobs.len());
    let device = device_for(plan, &context.devices);
    info!(
        worker = plan.worker_id,
        stride = plan.stride(),
        owned = owned.len(),
        device = %device,
        "running sweep shard"
    );
    let mut registry = ResultRegistry::new();
    for index in owned {
        let job = &jobs[index];
        match run_job(job, &device, context, &mut registry) {
            Ok(()) => {}
            Err(error) if context.keep_going => {
                warn!(job = %job.config.name, %error, "job failed, continuing");
            }
            Err(error) => {
                return Err(error).with_context(|| format!("job_failed: {}", job.config.name));
            }
        }
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Candidate, ParameterGrid};
    use crate::learner::ScriptedProvider;
    use crate::report::read_report_lines;
    use chrono::Utc;

    fn scratch_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "sot_sweep_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn plan_1000_100() -> TrainPlan {
        TrainPlan {
            train_steps: 1000,
            save_step: 100,
        }
    }

    #[test]
    fn shard_union_covers_every_job_exactly_once() {
        let mut seen = Vec::new();
        for worker_id in 0..4 {
            let plan = ShardPlan::new(worker_id, 4, 1).unwrap();
            seen.extend(plan.owned_indices(13));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..13).collect::<Vec<_>>());

        // Stride groups widen the stride without changing coverage.
        let grouped = ShardPlan::new(1, 4, 2).unwrap();
        assert_eq!(grouped.stride(), 8);
        assert_eq!(grouped.owned_indices(13), vec![1, 9]);
        let tail = ShardPlan::new(5, 4, 2).unwrap();
        assert_eq!(tail.owned_indices(13), vec![5]);
    }

    #[test]
    fn four_workers_split_a_two_by_two_grid() {
        let configs = ParameterGrid::new()
            .with(
                "a",
                "a",
                vec![
                    Candidate::plain(ParamValue::Int(1)),
                    Candidate::plain(ParamValue::Int(2)),
                ],
            )
            .with(
                "b",
                "b",
                vec![
                    Candidate::plain(ParamValue::Str("x".to_string())),
                    Candidate::plain(ParamValue::Str("y".to_string())),
                ],
            )
            .build()
            .unwrap();
        assert_eq!(configs.len(), 4);
        for worker_id in 0..4 {
            let plan = ShardPlan::new(worker_id, 4, 1).unwrap();
            assert_eq!(plan.owned_indices(configs.len()), vec![worker_id]);
        }
    }

    #[test]
    fn plan_geometry_is_validated() {
        assert!(ShardPlan::new(0, 0, 1).is_err());
        assert!(ShardPlan::new(0, 2, 0).is_err());
        assert!(ShardPlan::new(8, 4, 2).is_err());
        let plan = ShardPlan::new(5, 4, 2).unwrap();
        assert_eq!(plan.device_index(), 1);
    }

    #[test]
    fn load_resolution_matches_the_documented_points() {
        let plan = plan_1000_100();
        assert_eq!(resolve_load_steps(-1.0, &plan).unwrap(), 1000);
        assert_eq!(resolve_load_steps(-0.5, &plan).unwrap(), 500);
        assert_eq!(resolve_load_steps(200.0, &plan).unwrap(), 200);
        assert_eq!(resolve_load_steps(-300.0, &plan).unwrap(), 700);
        assert_eq!(resolve_load_steps(250.0, &plan).unwrap(), 200);

        assert!(resolve_load_steps(0.0, &plan).is_err());
        assert!(resolve_load_steps(1500.0, &plan).is_err());
        // A fraction below one save interval truncates to step zero.
        assert!(resolve_load_steps(0.05, &plan).is_err());
    }

    #[test]
    fn load_spec_parses_yaml_forms() {
        assert_eq!(
            serde_yaml::from_str::<LoadSpec>("latest").unwrap(),
            LoadSpec::Latest
        );
        assert_eq!(
            serde_yaml::from_str::<LoadSpec>("pretrained").unwrap(),
            LoadSpec::Pretrained
        );
        assert_eq!(
            serde_yaml::from_str::<LoadSpec>("-0.5").unwrap(),
            LoadSpec::Value(-0.5)
        );
        assert_eq!(serde_yaml::to_string(&LoadSpec::Value(-1.0)).unwrap().trim(), "-1");
        assert_eq!(
            resolve_load(&LoadSpec::Latest, &plan_1000_100()).unwrap().label(),
            "0"
        );
    }

    #[test]
    fn registry_rejects_duplicate_result_keys() {
        let mut registry = ResultRegistry::new();
        registry
            .register("cfg", "1000_default", ResultRecord::new())
            .unwrap();
        let error = registry
            .register("cfg", "1000_default", ResultRecord::new())
            .unwrap_err();
        assert!(matches!(error, HarnessError::Configuration(_)));
        registry
            .register("cfg", "1000_fast", ResultRecord::new())
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    fn scale_jobs(train: &TrainPlan) -> Vec<SweepJob> {
        ParameterGrid::new()
            .with(
                "offset_scale",
                "os",
                vec![
                    Candidate::plain(ParamValue::Float(0.0)),
                    Candidate::plain(ParamValue::Float(1.0)),
                ],
            )
            .build()
            .unwrap()
            .into_iter()
            .map(|config| SweepJob {
                config,
                train: train.clone(),
                loads: vec![LoadSpec::Value(-1.0)],
                evals: vec![EvalOptions::default()],
            })
            .collect()
    }

    #[test]
    fn sweep_trains_evaluates_and_writes_reports() {
        let root = scratch_root("run");
        let train = TrainPlan {
            train_steps: 400,
            save_step: 200,
        };
        let jobs = scale_jobs(&train);
        let provider = ScriptedProvider::new()
            .with_frame_count(10)
            .with_tracks(vec!["3".to_string()]);
        let context = SweepContext {
            learners: &provider,
            tracks: &provider,
            results_root: root.clone(),
            devices: vec!["cpu:0".to_string()],
            pretrained: None,
            keep_going: false,
        };
        let mut registry = run_sweep(&jobs, &ShardPlan::solo(), &context).unwrap();

        assert_eq!(provider.fit_count(), 2);
        assert_eq!(registry.len(), 2);
        assert!(checkpoint_file(&checkpoint_dir(&root, "os00"), 400).is_file());

        // Zero offset tracks perfectly, the scaled offset does not.
        let perfect = registry.get("os00", "400_default").unwrap();
        assert_eq!(perfect.get_f64("total_mean_iou3d"), Some(1.0));
        let offset = registry.get("os10", "400_default").unwrap();
        assert!(offset.get_f64("total_mean_iou3d").unwrap() < 1.0);

        let report = results_file(&root, "os10", "400", "default");
        let lines = read_report_lines(&report).unwrap();
        assert!(lines.iter().any(|(k, _)| k == "total_mean_iou3d"));
        assert!(lines
            .iter()
            .any(|(k, v)| k == "params" && v.contains("--load=400")));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn finished_training_is_skipped_on_rerun() {
        let root = scratch_root("resume");
        let train = TrainPlan {
            train_steps: 400,
            save_step: 200,
        };
        let jobs = scale_jobs(&train);
        let provider = ScriptedProvider::new()
            .with_frame_count(10)
            .with_tracks(vec!["3".to_string()]);
        let context = SweepContext {
            learners: &provider,
            tracks: &provider,
            results_root: root.clone(),
            devices: Vec::new(),
            pretrained: None,
            keep_going: false,
        };
        let first = run_sweep(&jobs, &ShardPlan::solo(), &context).unwrap();
        assert_eq!(provider.fit_count(), 2);

        let second = run_sweep(&jobs, &ShardPlan::solo(), &context).unwrap();
        assert_eq!(provider.fit_count(), 2);
        assert_eq!(
            first.get("os00", "400_default").unwrap().render(),
            second.get("os00", "400_default").unwrap().render()
        );
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn keep_going_swallows_job_failures() {
        let root = scratch_root("keep");
        let train = TrainPlan {
            train_steps: 400,
            save_step: 200,
        };
        let mut jobs = scale_jobs(&train);
        for job in &mut jobs {
            job.loads = vec![LoadSpec::Pretrained];
        }
        let provider = ScriptedProvider::new()
            .with_frame_count(10)
            .with_tracks(vec!["3".to_string()]);
        let mut context = SweepContext {
            learners: &provider,
            tracks: &provider,
            results_root: root.clone(),
            devices: Vec::new(),
            pretrained: None,
            keep_going: false,
        };
        assert!(run_sweep(&jobs, &ShardPlan::solo(), &context).is_err());

        context.keep_going = true;
        let registry = run_sweep(&jobs, &ShardPlan::solo(), &context).unwrap();
        assert!(registry.is_empty());
        std::fs::remove_dir_all(&root).ok();
    }
}
