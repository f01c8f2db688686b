use crate::HarnessError;
use serde::{Deserialize, Serialize};
use sot_core::TrackedBox;
use std::time::Duration;
use tracing::debug;

const CLOCK_EPS: f64 = 1e-9;

fn default_data_fps() -> f64 {
    20.0
}

fn default_warmups() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeOptions {
    #[serde(default = "default_data_fps")]
    pub data_fps: f64,
    #[serde(default)]
    pub require_predictive_inference: bool,
    #[serde(default)]
    pub wait_for_next_frame: bool,
    #[serde(default)]
    pub cap_model_fps: Option<f64>,
    #[serde(default = "default_warmups")]
    pub warmups: u32,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        RealtimeOptions {
            data_fps: default_data_fps(),
            require_predictive_inference: false,
            wait_for_next_frame: false,
            cap_model_fps: None,
            warmups: default_warmups(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPhase {
    Warmup,
    Tracking,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameAlignment {
    pub ground_truth: TrackedBox,
    pub prediction: TrackedBox,
    pub compared_frame: usize,
    pub prediction_frame: usize,
}

#[derive(Debug)]
pub struct RealTimeEvaluationScheduler {
    frame_period: f64,
    require_predictive_inference: bool,
    wait_for_next_frame: bool,
    min_inference_seconds: f64,
    warmups: u32,

    phase: TrackPhase,
    warmups_remaining: u32,
    awaiting_first_label: bool,
    start_frame: usize,
    last_label: Option<TrackedBox>,
    last_model_output: Option<TrackedBox>,
    last_processed_frame: usize,
    next_free_at: f64,
    current_frame_allowed: bool,
    extra_frame_allowance: bool,
    dropped_frames: u64,
    total_frames: u64,
}

impl RealTimeEvaluationScheduler {
    pub fn new(options: &RealtimeOptions) -> Result<Self, HarnessError> {
        if !options.data_fps.is_finite() || options.data_fps <= 0.0 {
            return Err(HarnessError::configuration(format!(
                "data_fps must be positive, got {}",
                options.data_fps
            )));
        }
        if let Some(cap) = options.cap_model_fps {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(HarnessError::configuration(format!(
                    "cap_model_fps must be positive, got {}",
                    cap
                )));
            }
        }
        Ok(RealTimeEvaluationScheduler {
            frame_period: 1.0 / options.data_fps,
            require_predictive_inference: options.require_predictive_inference,
            wait_for_next_frame: options.wait_for_next_frame,
            min_inference_seconds: options.cap_model_fps.map(|cap| 1.0 / cap).unwrap_or(0.0),
            warmups: options.warmups,
            phase: TrackPhase::Done,
            warmups_remaining: 0,
            awaiting_first_label: true,
            start_frame: 0,
            last_label: None,
            last_model_output: None,
            last_processed_frame: 0,
            next_free_at: 0.0,
            current_frame_allowed: false,
            extra_frame_allowance: false,
            dropped_frames: 0,
            total_frames: 0,
        })
    }

    pub fn init(&mut self, first_label: &TrackedBox, start_frame: usize) {
        self.awaiting_first_label = false;
        self.start_frame = start_frame;
        self.last_label = Some(first_label.clone());
        self.last_model_output = Some(first_label.clone());
        self.last_processed_frame = start_frame;
        self.next_free_at = 0.0;
        self.current_frame_allowed = false;
        self.extra_frame_allowance = !self.require_predictive_inference;
        self.dropped_frames = 0;
        self.total_frames = 0;
        self.warmups_remaining = self.warmups;
        self.phase = if self.warmups_remaining > 0 {
            TrackPhase::Warmup
        } else {
            TrackPhase::Tracking
        };
    }

    fn arrival(&self, frame_index: usize) -> f64 {
        frame_index.saturating_sub(self.start_frame) as f64 * self.frame_period
    }

    pub fn on_data(
        &mut self,
        label: Option<&TrackedBox>,
        frame_index: usize,
    ) -> Result<FrameAlignment, HarnessError> {
        if self.awaiting_first_label {
            return Err(HarnessError::state("on_data called before init"));
        }
        if self.phase == TrackPhase::Done {
            return Err(HarnessError::state("on_data called after track end"));
        }
        if let Some(label) = label {
            self.last_label = Some(label.clone());
        }
        let ground_truth = self
            .last_label
            .clone()
            .ok_or_else(|| HarnessError::state("no label has been observed"))?;

        if self.phase == TrackPhase::Warmup {
            self.current_frame_allowed = true;
        } else {
            let arrival = self.arrival(frame_index);
            let allowed = !self.require_predictive_inference
                || arrival + CLOCK_EPS >= self.next_free_at;
            if !allowed {
                self.dropped_frames += 1;
                debug!(
                    frame = frame_index,
                    arrival,
                    busy_until = self.next_free_at,
                    "frame dropped"
                );
            }
            self.current_frame_allowed = allowed;
        }

        let prediction = self
            .last_model_output
            .clone()
            .ok_or_else(|| HarnessError::state("scheduler output was not seeded"))?;
        Ok(FrameAlignment {
            ground_truth,
            prediction,
            compared_frame: frame_index,
            prediction_frame: self.last_processed_frame,
        })
    }

    pub fn can_frame_be_processed(&self) -> bool {
        self.current_frame_allowed
    }

    pub fn on_prediction(
        &mut self,
        result: TrackedBox,
        elapsed: Duration,
        frame_index: usize,
    ) -> Result<(), HarnessError> {
        if self.awaiting_first_label {
            return Err(HarnessError::state("on_prediction called before init"));
        }
        if self.phase == TrackPhase::Done {
            return Err(HarnessError::state("on_prediction called after track end"));
        }
        if !self.current_frame_allowed {
            return Err(HarnessError::state(
                "on_prediction called for a dropped frame",
            ));
        }
        self.current_frame_allowed = false;

        if self.phase == TrackPhase::Warmup {
            // Warm-up inferences are discarded: no scoring output, no
            // timing, no counters.
            self.warmups_remaining -= 1;
            if self.warmups_remaining == 0 {
                self.phase = TrackPhase::Tracking;
            }
            return Ok(());
        }

        let effective = elapsed.as_secs_f64().max(self.min_inference_seconds);
        let start = self.arrival(frame_index).max(self.next_free_at);
        let mut finished = start + effective;
        if self.wait_for_next_frame {
            let boundary = (finished / self.frame_period - CLOCK_EPS).ceil();
            finished = boundary * self.frame_period;
        }
        self.next_free_at = finished;
        self.last_model_output = Some(result);
        self.last_processed_frame = frame_index;
        self.total_frames += 1;
        debug!(
            frame = frame_index,
            elapsed = effective,
            busy_until = self.next_free_at,
            "prediction recorded"
        );
        Ok(())
    }

    pub fn take_extra_frame_allowance(&mut self) -> bool {
        if self.extra_frame_allowance {
            self.extra_frame_allowance = false;
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self) {
        self.phase = TrackPhase::Done;
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub fn is_warming_up(&self) -> bool {
        self.phase == TrackPhase::Warmup
    }

    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames
    }

    pub fn total_frame_count(&self) -> u64 {
        self.total_frames
    }

    pub fn warmups_remaining(&self) -> u32 {
        self.warmups_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_at(frame: usize) -> TrackedBox {
        TrackedBox::new(
            "Car",
            [frame as f64, 0.0, 0.0],
            [3.9, 1.6, 1.56],
            1,
            frame,
        )
    }

    fn options(fps: f64, predictive: bool, warmups: u32) -> RealtimeOptions {
        RealtimeOptions {
            data_fps: fps,
            require_predictive_inference: predictive,
            warmups,
            ..RealtimeOptions::default()
        }
    }

    fn run_track(
        scheduler: &mut RealTimeEvaluationScheduler,
        frames: usize,
        latency_for_call: impl Fn(usize) -> f64,
    ) {
        scheduler.init(&label_at(0), 0);
        let mut calls = 0;
        for i in 0..frames {
            scheduler.on_data(Some(&label_at(i)), i).unwrap();
            if scheduler.can_frame_be_processed() {
                let elapsed = Duration::from_secs_f64(latency_for_call(calls));
                calls += 1;
                scheduler
                    .on_prediction(label_at(i), elapsed, i)
                    .unwrap();
            }
        }
        scheduler.finish();
    }

    #[test]
    fn predictive_mode_drops_frames_behind_slow_calls() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 0)).unwrap();
        // Calls 3 and 6 overrun the 100ms frame period; the frame arriving
        // during each overrun is dropped.
        run_track(&mut scheduler, 10, |call| {
            if call == 3 || call == 6 {
                0.15
            } else {
                0.05
            }
        });
        assert_eq!(scheduler.dropped_frame_count(), 2);
        assert_eq!(scheduler.total_frame_count(), 8);
    }

    #[test]
    fn catch_up_mode_never_drops() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, false, 0)).unwrap();
        run_track(&mut scheduler, 10, |_| 0.25);
        assert_eq!(scheduler.dropped_frame_count(), 0);
        assert_eq!(scheduler.total_frame_count(), 10);
    }

    #[test]
    fn warmup_inferences_are_not_counted_or_scored() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 3)).unwrap();
        scheduler.init(&label_at(0), 0);
        assert!(scheduler.is_warming_up());
        for i in 0..3 {
            let alignment = scheduler.on_data(Some(&label_at(i)), i).unwrap();
            assert_eq!(alignment.prediction.frame, 0);
            assert!(scheduler.can_frame_be_processed());
            scheduler
                .on_prediction(label_at(i), Duration::from_secs_f64(9.0), i)
                .unwrap();
        }
        assert!(!scheduler.is_warming_up());
        assert_eq!(scheduler.warmups_remaining(), 0);
        assert_eq!(scheduler.total_frame_count(), 0);
        assert_eq!(scheduler.dropped_frame_count(), 0);
        // The slow warm-up timing never reached the clock.
        assert_eq!(scheduler.next_free_at, 0.0);
    }

    #[test]
    fn alignment_compares_against_the_stale_prediction() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 0)).unwrap();
        scheduler.init(&label_at(0), 0);
        for i in 0..4 {
            let alignment = scheduler.on_data(Some(&label_at(i)), i).unwrap();
            assert_eq!(alignment.compared_frame, i);
            if i == 0 {
                assert_eq!(alignment.prediction_frame, 0);
            } else {
                assert_eq!(alignment.prediction_frame, i - 1);
                assert_eq!(alignment.prediction, label_at(i - 1));
            }
            assert!(scheduler.can_frame_be_processed());
            scheduler
                .on_prediction(label_at(i), Duration::from_secs_f64(0.01), i)
                .unwrap();
        }
    }

    #[test]
    fn missing_label_reuses_the_last_observed_one() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, false, 0)).unwrap();
        scheduler.init(&label_at(0), 0);
        scheduler.on_data(Some(&label_at(0)), 0).unwrap();
        scheduler
            .on_prediction(label_at(0), Duration::from_secs_f64(0.01), 0)
            .unwrap();
        let alignment = scheduler.on_data(None, 1).unwrap();
        assert_eq!(alignment.ground_truth, label_at(0));
        assert_eq!(alignment.compared_frame, 1);
    }

    #[test]
    fn cap_model_fps_floors_the_effective_latency() {
        let mut scheduler = RealTimeEvaluationScheduler::new(&RealtimeOptions {
            data_fps: 10.0,
            require_predictive_inference: true,
            cap_model_fps: Some(5.0),
            warmups: 0,
            ..RealtimeOptions::default()
        })
        .unwrap();
        run_track(&mut scheduler, 10, |_| 0.001);
        // 200ms effective latency against a 100ms period: every other
        // frame is dropped.
        assert_eq!(scheduler.dropped_frame_count(), 5);
        assert_eq!(scheduler.total_frame_count(), 5);
    }

    #[test]
    fn wait_for_next_frame_rounds_up_to_the_boundary() {
        let mut scheduler = RealTimeEvaluationScheduler::new(&RealtimeOptions {
            data_fps: 10.0,
            require_predictive_inference: true,
            wait_for_next_frame: true,
            warmups: 0,
            ..RealtimeOptions::default()
        })
        .unwrap();
        scheduler.init(&label_at(0), 0);
        scheduler.on_data(Some(&label_at(0)), 0).unwrap();
        scheduler
            .on_prediction(label_at(0), Duration::from_secs_f64(0.03), 0)
            .unwrap();
        assert!((scheduler.next_free_at - 0.1).abs() < 1e-9);
        scheduler.on_data(Some(&label_at(1)), 1).unwrap();
        assert!(scheduler.can_frame_be_processed());
        assert_eq!(scheduler.dropped_frame_count(), 0);
    }

    #[test]
    fn extra_frame_allowance_is_consumed_once() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, false, 0)).unwrap();
        scheduler.init(&label_at(0), 0);
        assert!(scheduler.take_extra_frame_allowance());
        assert!(!scheduler.take_extra_frame_allowance());

        let mut predictive =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 0)).unwrap();
        predictive.init(&label_at(0), 0);
        assert!(!predictive.take_extra_frame_allowance());
    }

    #[test]
    fn scheduler_misuse_is_a_state_error() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 0)).unwrap();
        let err = scheduler.on_data(Some(&label_at(0)), 0).unwrap_err();
        assert!(matches!(err, HarnessError::State(_)));

        scheduler.init(&label_at(0), 0);
        let err = scheduler
            .on_prediction(label_at(0), Duration::from_secs_f64(0.01), 0)
            .unwrap_err();
        assert!(matches!(err, HarnessError::State(_)));

        scheduler.finish();
        let err = scheduler.on_data(Some(&label_at(1)), 1).unwrap_err();
        assert!(matches!(err, HarnessError::State(_)));
    }

    #[test]
    fn init_resets_counters_for_the_next_object() {
        let mut scheduler =
            RealTimeEvaluationScheduler::new(&options(10.0, true, 0)).unwrap();
        run_track(&mut scheduler, 10, |_| 0.15);
        assert!(scheduler.dropped_frame_count() > 0);
        scheduler.init(&label_at(0), 0);
        assert_eq!(scheduler.dropped_frame_count(), 0);
        assert_eq!(scheduler.total_frame_count(), 0);
        assert_eq!(scheduler.phase(), TrackPhase::Tracking);
    }

    #[test]
    fn invalid_pacing_options_are_rejected() {
        let err = RealTimeEvaluationScheduler::new(&RealtimeOptions {
            data_fps: 0.0,
            ..RealtimeOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));

        let err = RealTimeEvaluationScheduler::new(&RealtimeOptions {
            cap_model_fps: Some(-1.0),
            ..RealtimeOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }
}
