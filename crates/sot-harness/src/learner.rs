use crate::config::TrainPlan;
use crate::grid::SweepConfig;
use crate::HarnessError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sot_core::{atomic_write_string, FrameRecord, TrackedBox};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub boxes: Vec<TrackedBox>,
    pub elapsed: Duration,
}

pub trait Learner {
    fn init(&mut self, frame: &FrameRecord, label: &TrackedBox) -> Result<()>;
    fn infer(&mut self, frame: &FrameRecord) -> Result<Inference>;
    fn fit(
        &mut self,
        dataset: &dyn TrackDataset,
        plan: &TrainPlan,
        checkpoint_dir: &Path,
    ) -> Result<()>;
    fn load_latest(&mut self, checkpoint_dir: &Path) -> Result<()>;
    fn load_from_checkpoint(&mut self, checkpoint_dir: &Path, steps: i64) -> Result<()>;
    fn load_pretrained(&mut self, path: &Path) -> Result<()>;
    fn fps(&self) -> Option<f64>;
    fn times(&self) -> BTreeMap<String, Vec<f64>>;
}

pub trait TrackDataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn frame(&self, index: usize) -> Result<FrameRecord>;
    fn max_id(&self) -> i64;
}

pub trait TrackProvider {
    fn track_ids(&self) -> Vec<String>;
    fn track(&self, track_id: &str) -> Result<Box<dyn TrackDataset>>;
}

pub trait LearnerProvider {
    fn create(&self, config: &SweepConfig, device: &str) -> Result<Box<dyn Learner>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LatencyProfile {
    Constant(f64),
    Cycle(Vec<f64>),
}

impl LatencyProfile {
    pub fn at(&self, call_index: u64) -> f64 {
        match self {
            LatencyProfile::Constant(seconds) => *seconds,
            LatencyProfile::Cycle(values) if values.is_empty() => 0.0,
            LatencyProfile::Cycle(values) => values[call_index as usize % values.len()],
        }
    }
}

pub fn checkpoint_file(checkpoint_dir: &Path, steps: i64) -> std::path::PathBuf {
    checkpoint_dir.join(format!("checkpoint_{}.pth", steps))
}

fn checkpoint_steps(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix("checkpoint_")?
        .strip_suffix(".pth")?
        .parse()
        .ok()
}

pub struct ScriptedLearner {
    offset: [f64; 3],
    latency: LatencyProfile,
    fail_on_frames: Vec<usize>,
    target_id: Option<i64>,
    last_box: Option<TrackedBox>,
    calls: u64,
    infer_seconds: Vec<f64>,
    loaded: Option<String>,
    fit_calls: Option<Arc<AtomicUsize>>,
}

impl ScriptedLearner {
    pub fn new() -> Self {
        ScriptedLearner {
            offset: [0.0; 3],
            latency: LatencyProfile::Constant(0.02),
            fail_on_frames: Vec::new(),
            target_id: None,
            last_box: None,
            calls: 0,
            infer_seconds: Vec::new(),
            loaded: None,
            fit_calls: None,
        }
    }

    pub fn with_offset(mut self, offset: [f64; 3]) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_latency(mut self, latency: LatencyProfile) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failures(mut self, fail_on_frames: Vec<usize>) -> Self {
        self.fail_on_frames = fail_on_frames;
        self
    }

    fn with_fit_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.fit_calls = Some(counter);
        self
    }

    pub fn loaded_checkpoint(&self) -> Option<&str> {
        self.loaded.as_deref()
    }
}

impl Default for ScriptedLearner {
    fn default() -> Self {
        ScriptedLearner::new()
    }
}

impl Learner for ScriptedLearner {
    fn init(&mut self, _frame: &FrameRecord, label: &TrackedBox) -> Result<()> {
        self.target_id = Some(label.id);
        self.last_box = Some(label.clone());
        Ok(())
    }

    fn infer(&mut self, frame: &FrameRecord) -> Result<Inference> {
        if self.fail_on_frames.contains(&frame.index) {
            return Err(HarnessError::Inference(format!(
                "scripted failure at frame {}",
                frame.index
            ))
            .into());
        }
        let seconds = self.latency.at(self.calls);
        self.calls += 1;
        self.infer_seconds.push(seconds);

        let target_id = self
            .target_id
            .ok_or_else(|| HarnessError::state("infer called before init"))?;
        let mut result = match frame.label_for(target_id) {
            Some(label) => label.clone(),
            None => self
                .last_box
                .clone()
                .ok_or_else(|| HarnessError::state("no box to repeat"))?,
        };
        for (slot, delta) in result.location.iter_mut().zip(self.offset.iter()) {
            *slot += delta;
        }
        result.frame = frame.index;
        self.last_box = Some(result.clone());
        Ok(Inference {
            boxes: vec![result],
            elapsed: Duration::from_secs_f64(seconds),
        })
    }

    fn fit(
        &mut self,
        dataset: &dyn TrackDataset,
        plan: &TrainPlan,
        checkpoint_dir: &Path,
    ) -> Result<()> {
        plan.validate()?;
        if let Some(counter) = &self.fit_calls {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let final_step = plan.final_step();
        let mut step = plan.save_step;
        while step <= final_step {
            let payload = serde_json::json!({
                "steps": step,
                "train_frames": dataset.len(),
            });
            atomic_write_string(&checkpoint_file(checkpoint_dir, step), &payload.to_string())?;
            step += plan.save_step;
        }
        info!(final_step, dir = %checkpoint_dir.display(), "scripted training complete");
        Ok(())
    }

    fn load_latest(&mut self, checkpoint_dir: &Path) -> Result<()> {
        let entries = fs::read_dir(checkpoint_dir).map_err(|_| HarnessError::MissingCheckpoint {
            path: checkpoint_dir.to_path_buf(),
        })?;
        let mut newest: Option<i64> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(steps) = checkpoint_steps(&name) {
                newest = Some(newest.map_or(steps, |n: i64| n.max(steps)));
            }
        }
        match newest {
            Some(steps) => self.load_from_checkpoint(checkpoint_dir, steps),
            None => Err(HarnessError::MissingCheckpoint {
                path: checkpoint_dir.to_path_buf(),
            }
            .into()),
        }
    }

    fn load_from_checkpoint(&mut self, checkpoint_dir: &Path, steps: i64) -> Result<()> {
        let path = checkpoint_file(checkpoint_dir, steps);
        if !path.is_file() {
            return Err(HarnessError::MissingCheckpoint { path }.into());
        }
        self.loaded = Some(format!("checkpoint_{}", steps));
        Ok(())
    }

    fn load_pretrained(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(HarnessError::MissingCheckpoint {
                path: path.to_path_buf(),
            }
            .into());
        }
        self.loaded = Some(format!("pretrained:{}", path.display()));
        Ok(())
    }

    fn fps(&self) -> Option<f64> {
        let total: f64 = self.infer_seconds.iter().sum();
        if total > 0.0 {
            Some(self.infer_seconds.len() as f64 / total)
        } else {
            None
        }
    }

    fn times(&self) -> BTreeMap<String, Vec<f64>> {
        BTreeMap::from([("infer".to_string(), self.infer_seconds.clone())])
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSpec {
    pub id: i64,
    pub class_name: String,
    pub dimensions: [f64; 3],
    pub start: [f64; 3],
    pub velocity: [f64; 3],
    pub first_frame: usize,
    pub last_frame: usize,
}

pub struct ScriptedTrackDataset {
    frames: Vec<FrameRecord>,
    max_id: i64,
}

impl ScriptedTrackDataset {
    pub fn generate(frame_count: usize, objects: &[ObjectSpec]) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            let mut labels = Vec::new();
            for object in objects {
                if index < object.first_frame || index > object.last_frame {
                    continue;
                }
                let age = (index - object.first_frame) as f64;
                let location = [
                    object.start[0] + object.velocity[0] * age,
                    object.start[1] + object.velocity[1] * age,
                    object.start[2] + object.velocity[2] * age,
                ];
                labels.push(TrackedBox {
                    name: object.class_name.clone(),
                    location,
                    dimensions: object.dimensions,
                    rotation_y: 0.0,
                    id: object.id,
                    frame: index,
                });
            }
            frames.push(FrameRecord { index, labels });
        }
        let max_id = objects.iter().map(|o| o.id).max().unwrap_or(-1);
        ScriptedTrackDataset { frames, max_id }
    }

    // Two in-class objects (one leaving mid-track) plus one object outside
    // the default class filter.
    pub fn standard(seed: u64, frame_count: usize) -> Self {
        let objects = [
            ObjectSpec {
                id: 0,
                class_name: "Car".to_string(),
                dimensions: [3.9, 1.6, 1.56],
                start: [5.0 + (seed % 3) as f64, 0.0, 0.0],
                velocity: [0.5, 0.0, 0.0],
                first_frame: 0,
                last_frame: frame_count.saturating_sub(1),
            },
            ObjectSpec {
                id: 1,
                class_name: "Van".to_string(),
                dimensions: [5.0, 1.9, 2.0],
                start: [20.0, 5.0, 0.0],
                velocity: [-0.3, 0.1, 0.0],
                first_frame: 0,
                last_frame: frame_count / 2,
            },
            ObjectSpec {
                id: 2,
                class_name: "Pedestrian".to_string(),
                dimensions: [0.8, 0.6, 1.7],
                start: [8.0, 2.0, 0.0],
                velocity: [0.2, 0.0, 0.0],
                first_frame: 0,
                last_frame: frame_count.saturating_sub(1),
            },
        ];
        ScriptedTrackDataset::generate(frame_count, &objects)
    }
}

impl TrackDataset for ScriptedTrackDataset {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, index: usize) -> Result<FrameRecord> {
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("frame_out_of_range: {} of {}", index, self.frames.len()))
    }

    fn max_id(&self) -> i64 {
        self.max_id
    }
}

pub struct ScriptedProvider {
    offset: [f64; 3],
    latency: LatencyProfile,
    frame_count: usize,
    track_ids: Vec<String>,
    fit_calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        ScriptedProvider {
            offset: [0.5, 0.0, 0.0],
            latency: LatencyProfile::Constant(0.02),
            frame_count: 40,
            track_ids: vec!["0010".to_string(), "0011".to_string()],
            fit_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_offset(mut self, offset: [f64; 3]) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_latency(mut self, latency: LatencyProfile) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_tracks(mut self, track_ids: Vec<String>) -> Self {
        self.track_ids = track_ids;
        self
    }

    pub fn fit_count(&self) -> usize {
        self.fit_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        ScriptedProvider::new()
    }
}

impl LearnerProvider for ScriptedProvider {
    fn create(&self, config: &SweepConfig, device: &str) -> Result<Box<dyn Learner>> {
        // An "offset_scale" parameter lets sweep configurations produce
        // visibly different accuracy numbers.
        let scale = config
            .value("offset_scale")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        let offset = [
            self.offset[0] * scale,
            self.offset[1] * scale,
            self.offset[2] * scale,
        ];
        info!(config = %config.name, device, "creating scripted learner");
        Ok(Box::new(
            ScriptedLearner::new()
                .with_offset(offset)
                .with_latency(self.latency.clone())
                .with_fit_counter(Arc::clone(&self.fit_calls)),
        ))
    }
}

impl TrackProvider for ScriptedProvider {
    fn track_ids(&self) -> Vec<String> {
        self.track_ids.clone()
    }

    fn track(&self, track_id: &str) -> Result<Box<dyn TrackDataset>> {
        let seed = track_id
            .parse::<u64>()
            .unwrap_or_else(|_| track_id.bytes().map(u64::from).sum());
        Ok(Box::new(ScriptedTrackDataset::standard(
            seed,
            self.frame_count,
        )))
    }
}
