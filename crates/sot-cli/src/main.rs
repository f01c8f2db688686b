use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sot_core::{atomic_write_string, format_float, ParamValue};
use sot_harness::{
    collect_results, device_for, evaluate_tracks, evaluate_tracks_realtime, load_sweep_file,
    parse_params_file, render_collected, resolve_load, run_sweep, write_report, CollectOptions,
    ConfigKey, EvalOptions, LearnerProvider, LoadSpec, ParamsSchema, RealtimeOptions,
    ResolvedLoad, ResultRecord, ScriptedProvider, ShardPlan, SweepConfig, SweepContext, TrainPlan,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sot", version = "0.1.0", about = "Single-object tracking sweep harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Grid {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Shard {
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        worker_id: usize,
        #[arg(long, default_value_t = 1)]
        worker_count: usize,
        #[arg(long, default_value_t = 1)]
        stride_group_size: usize,
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    ResolveLoad {
        #[arg(required = true)]
        loads: Vec<String>,
        #[arg(long, default_value_t = 200_000)]
        train_steps: i64,
        #[arg(long, default_value_t = 2_000)]
        save_step: i64,
        #[arg(long)]
        json: bool,
    },
    Sweep {
        config: PathBuf,
        #[arg(long)]
        results_root: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        worker_id: usize,
        #[arg(long, default_value_t = 1)]
        worker_count: usize,
        #[arg(long, default_value_t = 1)]
        stride_group_size: usize,
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long)]
        pretrained: Option<PathBuf>,
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        frame_count: Option<usize>,
        #[arg(long = "track")]
        tracks: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Eval {
        #[arg(long)]
        params_file: Option<PathBuf>,
        #[arg(long)]
        realtime: bool,
        #[arg(long)]
        data_fps: Option<f64>,
        #[arg(long)]
        predictive: bool,
        #[arg(long)]
        warmups: Option<u32>,
        #[arg(long)]
        eval_id: Option<String>,
        #[arg(long)]
        iou_min: Option<f64>,
        #[arg(long = "class")]
        classes: Vec<String>,
        #[arg(long = "track")]
        tracks: Vec<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long, default_value = "cpu")]
        device: String,
        #[arg(long)]
        frame_count: Option<usize>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Collect {
        root: PathBuf,
        #[arg(long, default_value = "total_success")]
        sort_by: String,
        #[arg(long = "name-filter")]
        name_filters: Vec<String>,
        #[arg(long)]
        file_filter: Option<String>,
        #[arg(long = "track")]
        tracks: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Grid { config, json } => {
            let file = load_sweep_file(&config)?;
            let configs = file.configs()?;
            if json {
                let items: Vec<Value> = configs
                    .iter()
                    .map(|config| {
                        json!({
                            "name": config.name,
                            "canonical": config.canonical(),
                            "params": pairs_to_json(config.key.pairs()),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "grid",
                    "config_count": configs.len(),
                    "configs": items
                })));
            }
            for config in &configs {
                println!("{}: {}", config.name, config.canonical());
            }
        }
        Commands::Shard {
            config,
            worker_id,
            worker_count,
            stride_group_size,
            devices,
            json,
        } => {
            let file = load_sweep_file(&config)?;
            let jobs = file.jobs()?;
            let plan = ShardPlan::new(worker_id, worker_count, stride_group_size)?;
            let device = device_for(&plan, &devices);
            let owned = plan.owned_indices(jobs.len());
            if json {
                let items: Vec<Value> = owned
                    .iter()
                    .map(|&index| json!({"index": index, "config": jobs[index].config.name}))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "shard",
                    "job_count": jobs.len(),
                    "stride": plan.stride(),
                    "device": device,
                    "owned": items
                })));
            }
            println!("jobs: {}", jobs.len());
            println!("stride: {}", plan.stride());
            println!("device: {}", device);
            for index in owned {
                println!("{}: {}", index, jobs[index].config.name);
            }
        }
        Commands::ResolveLoad {
            loads,
            train_steps,
            save_step,
            json,
        } => {
            let plan = TrainPlan {
                train_steps,
                save_step,
            };
            plan.validate()?;
            let mut rows = Vec::new();
            for raw in &loads {
                let spec = parse_load_value(raw)?;
                rows.push((raw.clone(), resolve_load(&spec, &plan)?));
            }
            if json {
                let items: Vec<Value> = rows
                    .iter()
                    .map(|(raw, resolved)| {
                        let steps = match resolved {
                            ResolvedLoad::Steps(steps) => Some(*steps),
                            _ => None,
                        };
                        json!({
                            "load": raw,
                            "kind": resolved_kind(resolved),
                            "steps": steps,
                            "label": resolved.label(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "resolve-load",
                    "train_steps": plan.train_steps,
                    "save_step": plan.save_step,
                    "loads": items
                })));
            }
            for (raw, resolved) in &rows {
                println!("{}: {}", raw, describe_resolved(resolved));
            }
        }
        Commands::Sweep {
            config,
            results_root,
            worker_id,
            worker_count,
            stride_group_size,
            devices,
            pretrained,
            keep_going,
            frame_count,
            tracks,
            json,
        } => {
            let file = load_sweep_file(&config)?;
            let jobs = file.jobs()?;
            let plan = ShardPlan::new(worker_id, worker_count, stride_group_size)?;
            let provider = scripted_provider(frame_count, &tracks);
            let root = results_root.unwrap_or_else(|| file.results_root.clone());
            let context = SweepContext {
                learners: &provider,
                tracks: &provider,
                results_root: root.clone(),
                devices,
                pretrained,
                keep_going,
            };
            let mut registry = run_sweep(&jobs, &plan, &context)?;
            if json {
                let items: Vec<Value> = registry
                    .drain()
                    .into_iter()
                    .map(|(name, key, record)| {
                        json!({
                            "config": name,
                            "result": key,
                            "total_precision": record.get_f64("total_precision"),
                            "total_success": record.get_f64("total_success"),
                            "total_mean_iou3d": record.get_f64("total_mean_iou3d"),
                            "fps": record.get_f64("fps"),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "results_root": root.display().to_string(),
                    "job_count": jobs.len(),
                    "owned": plan.owned_indices(jobs.len()),
                    "results": items
                })));
            }
            println!("results_root: {}", root.display());
            for (name, key, record) in registry.drain() {
                println!(
                    "{} {}: precision {} success {} iou3d {} fps {}",
                    name,
                    key,
                    metric(&record, "total_precision"),
                    metric(&record, "total_success"),
                    metric(&record, "total_mean_iou3d"),
                    metric(&record, "fps"),
                );
            }
        }
        Commands::Eval {
            params_file,
            realtime,
            data_fps,
            predictive,
            warmups,
            eval_id,
            iou_min,
            classes,
            tracks,
            set_values,
            device,
            frame_count,
            out,
            json,
        } => {
            let mut options = EvalOptions::default();
            // --set pairs are seeded first so they win over params-file values.
            for (name, value) in parse_set_bindings(&set_values)? {
                options.overrides.insert(name, value);
            }
            let mut config_name = "eval".to_string();
            if let Some(path) = &params_file {
                let parsed = parse_params_file(path, &ParamsSchema::default())?;
                if let Some(name) = &parsed.config_name {
                    config_name = name.clone();
                }
                options.absorb_params(&parsed)?;
            }
            if realtime || data_fps.is_some() || predictive || warmups.is_some() {
                let mut pacing = RealtimeOptions::default();
                if let Some(fps) = data_fps {
                    pacing.data_fps = fps;
                }
                pacing.require_predictive_inference = predictive;
                if let Some(count) = warmups {
                    pacing.warmups = count;
                }
                options.realtime = Some(pacing);
            }
            if let Some(id) = eval_id {
                options.eval_id = id;
            }
            if let Some(min) = iou_min {
                options.iou_min = min;
            }
            if !classes.is_empty() {
                options.classes = classes;
            }
            if !tracks.is_empty() {
                options.tracks = Some(tracks);
            }
            options.validate()?;
            let provider = scripted_provider(frame_count, &[]);
            let config = SweepConfig {
                key: ConfigKey::from_pairs(options.override_pairs()),
                name: config_name,
            };
            let mut learner = provider.create(&config, &device)?;
            let params = config.key.pairs().to_vec();
            let record = if options.realtime.is_some() {
                evaluate_tracks_realtime(learner.as_mut(), &provider, &options, &params)?
            } else {
                evaluate_tracks(learner.as_mut(), &provider, &options, &params)?
            };
            if let Some(path) = &out {
                write_report(path, &record)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "eval",
                    "config": config.name,
                    "realtime": options.realtime.is_some(),
                    "report": record_to_json(&record)
                })));
            }
            print!("{}", record.render());
            if let Some(path) = &out {
                println!("report: {}", path.display());
            }
        }
        Commands::Collect {
            root,
            sort_by,
            name_filters,
            file_filter,
            tracks,
            out,
            json,
        } => {
            let options = CollectOptions {
                name_filters,
                file_filter,
                tracks: if tracks.is_empty() { None } else { Some(tracks) },
                sort_by,
            };
            let rows = collect_results(&root, &options)?;
            let table = render_collected(&rows);
            if let Some(path) = &out {
                atomic_write_string(path, &table)
                    .with_context(|| format!("table_write_failed: {}", path.display()))?;
            }
            if json {
                let items: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        json!({
                            "path": row.path.display().to_string(),
                            "config": row.config_name,
                            "metrics": row.values,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "row_count": rows.len(),
                    "sort_by": options.sort_by,
                    "rows": items
                })));
            }
            print!("{}", table);
            if let Some(path) = &out {
                println!("table: {}", path.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Grid { json, .. }
        | Commands::Shard { json, .. }
        | Commands::ResolveLoad { json, .. }
        | Commands::Sweep { json, .. }
        | Commands::Eval { json, .. }
        | Commands::Collect { json, .. } => *json,
    }
}

fn scripted_provider(frame_count: Option<usize>, tracks: &[String]) -> ScriptedProvider {
    let mut provider = ScriptedProvider::new();
    if let Some(frames) = frame_count {
        provider = provider.with_frame_count(frames);
    }
    if !tracks.is_empty() {
        provider = provider.with_tracks(tracks.to_vec());
    }
    provider
}

fn parse_load_value(raw: &str) -> Result<LoadSpec> {
    match raw {
        "latest" => Ok(LoadSpec::Latest),
        "pretrained" => Ok(LoadSpec::Pretrained),
        other => {
            let value: f64 = other
                .parse()
                .with_context(|| format!("load_unparsable: {}", other))?;
            Ok(LoadSpec::Value(value))
        }
    }
}

fn resolved_kind(resolved: &ResolvedLoad) -> &'static str {
    match resolved {
        ResolvedLoad::Latest => "latest",
        ResolvedLoad::Pretrained => "pretrained",
        ResolvedLoad::Steps(_) => "steps",
    }
}

fn describe_resolved(resolved: &ResolvedLoad) -> String {
    match resolved {
        ResolvedLoad::Latest => "latest checkpoint".to_string(),
        ResolvedLoad::Pretrained => "pretrained weights".to_string(),
        ResolvedLoad::Steps(steps) => format!("step {}", steps),
    }
}

fn parse_set_bindings(values: &[String]) -> Result<Vec<(String, ParamValue)>> {
    let mut out = Vec::new();
    for raw in values {
        let (key, raw_value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!(format!("invalid --set '{}': expected k=v", raw)))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(format!(
                "invalid --set '{}': key cannot be empty",
                raw
            )));
        }
        out.push((key.to_string(), ParamValue::parse_literal(raw_value)));
    }
    Ok(out)
}

fn metric(record: &ResultRecord, key: &str) -> String {
    match record.get_f64(key) {
        Some(value) => format_float(value),
        None => "None".to_string(),
    }
}

fn pairs_to_json(pairs: &[(String, ParamValue)]) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in pairs {
        map.insert(name.clone(), value.to_json());
    }
    Value::Object(map)
}

fn record_to_json(record: &ResultRecord) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in record.pairs() {
        map.insert(key.clone(), value.clone());
    }
    Value::Object(map)
}
