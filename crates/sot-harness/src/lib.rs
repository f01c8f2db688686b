use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod evaluate;
pub mod grid;
pub mod learner;
pub mod metrics;
pub mod params;
pub mod realtime;
pub mod report;
pub mod sweep;

pub use config::{load_sweep_file, EvalOptions, SweepFile, TrainPlan};
pub use evaluate::{evaluate_tracks, evaluate_tracks_realtime};
pub use grid::{Candidate, ConfigKey, GridParam, ParameterGrid, SweepConfig};
pub use learner::{
    Inference, LatencyProfile, Learner, LearnerProvider, ScriptedLearner, ScriptedProvider,
    ScriptedTrackDataset, TrackDataset, TrackProvider,
};
pub use metrics::StreamingMetric;
pub use params::{params_line, parse_params_file, ParamsSchema, ParsedParams};
pub use realtime::{FrameAlignment, RealTimeEvaluationScheduler, RealtimeOptions, TrackPhase};
pub use report::{
    collect_results, render_collected, write_report, CollectOptions, CollectedRow, ResultRecord,
};
pub use sweep::{
    device_for, resolve_load, resolve_load_steps, run_sweep, LoadSpec, ResolvedLoad,
    ResultRegistry, ShardPlan, SweepContext, SweepJob,
};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration_invalid: {0}")]
    Configuration(String),
    #[error("inference_failed: {0}")]
    Inference(String),
    #[error("checkpoint_missing: {}", path.display())]
    MissingCheckpoint { path: PathBuf },
    #[error("scheduler_state: {0}")]
    State(String),
}

impl HarnessError {
    pub fn configuration(detail: impl Into<String>) -> Self {
        HarnessError::Configuration(detail.into())
    }

    pub fn state(detail: impl Into<String>) -> Self {
        HarnessError::State(detail.into())
    }
}
