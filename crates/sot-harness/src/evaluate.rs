use crate::config::EvalOptions;
use crate::learner::{Inference, Learner, TrackDataset, TrackProvider};
use crate::metrics::{mean_of, StreamingMetric};
use crate::params::params_line;
use crate::realtime::RealTimeEvaluationScheduler;
use crate::report::ResultRecord;
use crate::HarnessError;
use anyhow::{Context, Result};
use sot_core::{
    aabb_iou_3d, aabb_iou_bev, center_error, format_float, vertical_error, FrameRecord,
    ParamValue, TrackedBox,
};
use std::time::Duration;
use tracing::{debug, info, warn};

fn same_geometry(a: &TrackedBox, b: &TrackedBox) -> bool {
    a.location == b.location && a.dimensions == b.dimensions && a.rotation_y == b.rotation_y
}

struct FrameScore {
    iou3d: f64,
    iou_aabb: f64,
    accuracy: f64,
    iou3d_ideal: f64,
    accuracy_ideal: f64,
    iou3d_same: f64,
    accuracy_same: f64,
}

impl FrameScore {
    fn measured(gt: &TrackedBox, prediction: &TrackedBox, exact_match_is_full: bool) -> FrameScore {
        // Identical geometry short-circuits to 1.0 so degenerate boxes do not
        // divide zero volume by zero volume.
        let iou3d = if exact_match_is_full && same_geometry(gt, prediction) {
            1.0
        } else {
            aabb_iou_3d(gt, prediction)
        };
        let ideal = prediction.with_vertical_from(gt);
        let nudged = gt.nudged(1e-5);
        FrameScore {
            iou3d,
            iou_aabb: aabb_iou_bev(gt, prediction),
            accuracy: center_error(gt, prediction),
            iou3d_ideal: aabb_iou_3d(gt, &ideal),
            accuracy_ideal: center_error(gt, &ideal),
            iou3d_same: aabb_iou_3d(gt, &nudged),
            accuracy_same: center_error(gt, gt),
        }
    }

    fn zeroed() -> FrameScore {
        FrameScore {
            iou3d: 0.0,
            iou_aabb: 0.0,
            accuracy: 0.0,
            iou3d_ideal: 0.0,
            accuracy_ideal: 0.0,
            iou3d_same: 0.0,
            accuracy_same: 0.0,
        }
    }
}

struct EvalTotals {
    precision: StreamingMetric,
    success: StreamingMetric,
    precision_near: StreamingMetric,
    success_near: StreamingMetric,
    precision_far: StreamingMetric,
    success_far: StreamingMetric,
    precision_ideal: StreamingMetric,
    success_ideal: StreamingMetric,
    precision_same: StreamingMetric,
    success_same: StreamingMetric,
    vertical_error: StreamingMetric,
    vertical_error_no_regress: StreamingMetric,
    all_vertical_error: Vec<f64>,
    all_vertical_error_no_regress: Vec<f64>,
    object_precisions: Vec<Vec<String>>,
    object_successes: Vec<Vec<String>>,
}

impl EvalTotals {
    fn new() -> Self {
        EvalTotals {
            precision: StreamingMetric::new(),
            success: StreamingMetric::new(),
            precision_near: StreamingMetric::new(),
            success_near: StreamingMetric::new(),
            precision_far: StreamingMetric::new(),
            success_far: StreamingMetric::new(),
            precision_ideal: StreamingMetric::new(),
            success_ideal: StreamingMetric::new(),
            precision_same: StreamingMetric::new(),
            success_same: StreamingMetric::new(),
            vertical_error: StreamingMetric::new(),
            vertical_error_no_regress: StreamingMetric::new(),
            all_vertical_error: Vec::new(),
            all_vertical_error_no_regress: Vec::new(),
            object_precisions: Vec::new(),
            object_successes: Vec::new(),
        }
    }

    fn add_frame(&mut self, score: &FrameScore, distance: f64, near_distance: f64) {
        self.precision.add(score.accuracy);
        self.success.add(score.iou3d);
        self.precision_same.add(score.accuracy_same);
        self.success_same.add(score.iou3d_same);
        self.precision_ideal.add(score.accuracy_ideal);
        self.success_ideal.add(score.iou3d_ideal);
        if distance < near_distance {
            self.precision_near.add(score.accuracy);
            self.success_near.add(score.iou3d);
        } else {
            self.precision_far.add(score.accuracy);
            self.success_far.add(score.iou3d);
        }
    }
}

struct ObjectScores {
    iou3d: StreamingMetric,
    iou_aabb: StreamingMetric,
    precision: StreamingMetric,
    success: StreamingMetric,
    vertical_error: StreamingMetric,
    vertical_error_no_regress: StreamingMetric,
    frames: usize,
    count_tracked: usize,
}

impl ObjectScores {
    fn new() -> Self {
        ObjectScores {
            iou3d: StreamingMetric::new(),
            iou_aabb: StreamingMetric::new(),
            precision: StreamingMetric::new(),
            success: StreamingMetric::new(),
            vertical_error: StreamingMetric::new(),
            vertical_error_no_regress: StreamingMetric::new(),
            frames: 0,
            count_tracked: 0,
        }
    }

    fn add_frame(&mut self, score: &FrameScore) {
        self.iou3d.add(score.iou3d);
        self.iou_aabb.add(score.iou_aabb);
        self.precision.add(score.accuracy);
        self.success.add(score.iou3d);
        self.frames += 1;
    }

    fn finish(self, totals: &mut EvalTotals) -> Option<ObjectMeans> {
        totals
            .all_vertical_error
            .push(self.vertical_error.average_or(-1.0));
        totals
            .all_vertical_error_no_regress
            .push(self.vertical_error_no_regress.average_or(-1.0));
        let (Some(iou3d), Some(iou_aabb), Some(precision), Some(success)) = (
            self.iou3d.average(),
            self.iou_aabb.average(),
            self.precision.average(),
            self.success.average(),
        ) else {
            return None;
        };
        Some(ObjectMeans {
            iou3d,
            iou_aabb,
            tracked: self.count_tracked as f64 / self.frames as f64,
            precision,
            success,
        })
    }
}

struct ObjectMeans {
    iou3d: f64,
    iou_aabb: f64,
    tracked: f64,
    precision: f64,
    success: f64,
}

#[derive(Default)]
struct TrackLists {
    iou3ds: Vec<f64>,
    iou_aabbs: Vec<f64>,
    tracked: Vec<f64>,
    precision: Vec<f64>,
    success: Vec<f64>,
}

fn rollup_track(survivors: &[ObjectMeans], totals: &mut EvalTotals, lists: &mut TrackLists) {
    totals.object_precisions.push(
        survivors
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}: {}", i, format_float(m.precision)))
            .collect(),
    );
    totals.object_successes.push(
        survivors
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}: {}", i, format_float(m.success)))
            .collect(),
    );
    if survivors.is_empty() {
        return;
    }
    let count = survivors.len() as f64;
    lists
        .iou3ds
        .push(survivors.iter().map(|m| m.iou3d).sum::<f64>() / count);
    lists
        .iou_aabbs
        .push(survivors.iter().map(|m| m.iou_aabb).sum::<f64>() / count);
    lists
        .tracked
        .push(survivors.iter().map(|m| m.tracked).sum::<f64>() / count);
    lists
        .precision
        .push(survivors.iter().map(|m| m.precision).sum::<f64>() / count);
    lists
        .success
        .push(survivors.iter().map(|m| m.success).sum::<f64>() / count);
}

fn object_ids(dataset: &dyn TrackDataset, options: &EvalOptions) -> std::ops::Range<i64> {
    let upper = dataset.max_id() + 1;
    if options.limit_object_ids {
        0..upper.min(5)
    } else {
        0..upper
    }
}

fn find_start(
    dataset: &dyn TrackDataset,
    object_id: i64,
) -> Result<Option<(usize, FrameRecord, TrackedBox)>> {
    for index in 0..dataset.len() {
        let frame = dataset.frame(index)?;
        if let Some(label) = frame.label_for(object_id) {
            let label = label.clone();
            return Ok(Some((index, frame, label)));
        }
    }
    Ok(None)
}

fn first_box(inference: Inference) -> Result<(TrackedBox, Duration)> {
    let elapsed = inference.elapsed;
    match inference.boxes.into_iter().next() {
        Some(prediction) => Ok((prediction, elapsed)),
        None => Err(HarnessError::Inference("no boxes returned".to_string()).into()),
    }
}

fn evaluate_object(
    learner: &mut dyn Learner,
    dataset: &dyn TrackDataset,
    object_id: i64,
    options: &EvalOptions,
    totals: &mut EvalTotals,
) -> Result<Option<ObjectMeans>> {
    let Some((start, first_frame, init_label)) = find_start(dataset, object_id)? else {
        return Ok(None);
    };
    if !options.classes.contains(&init_label.name) {
        return Ok(None);
    }
    // The starting state is known exactly, so the totals begin with one
    // perfect score per object.
    totals.precision.add(0.0);
    totals.success.add(1.0);
    learner.init(&first_frame, &init_label)?;

    let mut scores = ObjectScores::new();
    for index in start..dataset.len() {
        let frame = dataset.frame(index)?;
        let Some(label) = frame.label_for(object_id).cloned() else {
            break;
        };
        let score = match learner.infer(&frame).and_then(first_box) {
            Ok((prediction, _elapsed)) => {
                let score = FrameScore::measured(&label, &prediction, false);
                if score.iou3d > options.iou_min {
                    scores.count_tracked += 1;
                }
                let rise = vertical_error(&label, &prediction);
                let rise_no_regress = vertical_error(&label, &init_label);
                totals.vertical_error.add(rise);
                totals.vertical_error_no_regress.add(rise_no_regress);
                scores.vertical_error.add(rise);
                scores.vertical_error_no_regress.add(rise_no_regress);
                score
            }
            Err(error) => {
                if options.raise_on_infer_error {
                    return Err(error);
                }
                warn!(object_id, frame = index, %error, "inference failed, frame scored as zero");
                FrameScore::zeroed()
            }
        };
        let distance = label.range();
        scores.add_frame(&score);
        totals.add_frame(&score, distance, options.near_distance);
        debug!(
            object_id,
            frame = index,
            iou3d = score.iou3d,
            accuracy = score.accuracy,
            distance,
            "frame scored"
        );
    }
    Ok(scores.finish(totals))
}

pub fn evaluate_tracks(
    learner: &mut dyn Learner,
    tracks: &dyn TrackProvider,
    options: &EvalOptions,
    params: &[(String, ParamValue)],
) -> Result<ResultRecord> {
    let track_ids = options
        .tracks
        .clone()
        .unwrap_or_else(|| tracks.track_ids());
    let mut totals = EvalTotals::new();
    let mut lists = TrackLists::default();
    for track_id in &track_ids {
        info!(track = %track_id, "evaluating track");
        let dataset = tracks
            .track(track_id)
            .with_context(|| format!("track_open: {}", track_id))?;
        let mut survivors = Vec::new();
        for object_id in object_ids(dataset.as_ref(), options) {
            if let Some(means) =
                evaluate_object(learner, dataset.as_ref(), object_id, options, &mut totals)?
            {
                survivors.push(means);
            }
        }
        rollup_track(&survivors, &mut totals, &mut lists);
    }
    Ok(assemble_record(
        &totals,
        &lists,
        &track_ids,
        learner.fps(),
        params,
        None,
    ))
}

fn evaluate_object_realtime(
    learner: &mut dyn Learner,
    dataset: &dyn TrackDataset,
    object_id: i64,
    options: &EvalOptions,
    scheduler: &mut RealTimeEvaluationScheduler,
    totals: &mut EvalTotals,
    frame_counts: &mut (u64, u64),
) -> Result<Option<ObjectMeans>> {
    let Some((start, first_frame, init_label)) = find_start(dataset, object_id)? else {
        return Ok(None);
    };
    if !options.classes.contains(&init_label.name) {
        return Ok(None);
    }
    learner.init(&first_frame, &init_label)?;
    scheduler.init(&init_label, start);

    let mut scores = ObjectScores::new();
    let mut index = start;
    while index < dataset.len() {
        let frame = dataset.frame(index)?;
        let label = frame.label_for(object_id).cloned();
        if label.is_none() {
            // The last prediction has not been scored yet; one extra pass over
            // the previous frame closes the gap when pacing allows it.
            if scheduler.take_extra_frame_allowance() {
                index = index.saturating_sub(1);
                continue;
            }
            break;
        }
        let alignment = scheduler.on_data(label.as_ref(), index)?;
        if scheduler.can_frame_be_processed() {
            match learner.infer(&frame).and_then(first_box) {
                Ok((prediction, elapsed)) => {
                    scheduler.on_prediction(prediction, elapsed, index)?;
                }
                Err(error) => {
                    if options.raise_on_infer_error {
                        return Err(error);
                    }
                    warn!(object_id, frame = index, %error, "inference failed, keeping last prediction");
                }
            }
        }
        let score = FrameScore::measured(&alignment.ground_truth, &alignment.prediction, true);
        if score.iou3d > options.iou_min {
            scores.count_tracked += 1;
        }
        let rise = vertical_error(&alignment.ground_truth, &alignment.prediction);
        let rise_no_regress = vertical_error(&alignment.ground_truth, &init_label);
        totals.vertical_error.add(rise);
        totals.vertical_error_no_regress.add(rise_no_regress);
        scores.vertical_error.add(rise);
        scores.vertical_error_no_regress.add(rise_no_regress);
        let distance = alignment.ground_truth.range();
        scores.add_frame(&score);
        totals.add_frame(&score, distance, options.near_distance);
        debug!(
            object_id,
            frame = index,
            compared = alignment.compared_frame,
            predicted_from = alignment.prediction_frame,
            iou3d = score.iou3d,
            "frame scored against stale prediction"
        );
        index += 1;
    }
    frame_counts.0 += scheduler.total_frame_count();
    frame_counts.1 += scheduler.dropped_frame_count();
    scheduler.finish();
    Ok(scores.finish(totals))
}

pub fn evaluate_tracks_realtime(
    learner: &mut dyn Learner,
    tracks: &dyn TrackProvider,
    options: &EvalOptions,
    params: &[(String, ParamValue)],
) -> Result<ResultRecord> {
    let pacing = options.realtime.clone().unwrap_or_default();
    let mut scheduler = RealTimeEvaluationScheduler::new(&pacing)?;
    let track_ids = options
        .tracks
        .clone()
        .unwrap_or_else(|| tracks.track_ids());
    let mut totals = EvalTotals::new();
    let mut lists = TrackLists::default();
    let mut frame_counts = (0u64, 0u64);
    for track_id in &track_ids {
        info!(track = %track_id, "evaluating track in real time");
        let dataset = tracks
            .track(track_id)
            .with_context(|| format!("track_open: {}", track_id))?;
        let mut survivors = Vec::new();
        for object_id in object_ids(dataset.as_ref(), options) {
            if let Some(means) = evaluate_object_realtime(
                learner,
                dataset.as_ref(),
                object_id,
                options,
                &mut scheduler,
                &mut totals,
                &mut frame_counts,
            )? {
                survivors.push(means);
            }
        }
        rollup_track(&survivors, &mut totals, &mut lists);
    }
    info!(
        total_frames = frame_counts.0,
        dropped_frames = frame_counts.1,
        "real-time evaluation finished"
    );
    Ok(assemble_record(
        &totals,
        &lists,
        &track_ids,
        learner.fps(),
        params,
        Some(frame_counts),
    ))
}

fn assemble_record(
    totals: &EvalTotals,
    lists: &TrackLists,
    tracks: &[String],
    fps: Option<f64>,
    params: &[(String, ParamValue)],
    frame_counts: Option<(u64, u64)>,
) -> ResultRecord {
    let mut record = ResultRecord::new();
    record.push_optional("total_mean_iou3d", mean_of(&lists.iou3ds));
    record.push_optional("total_mean_iouAabb", mean_of(&lists.iou_aabbs));
    record.push_optional("total_mean_tracked", mean_of(&lists.tracked));
    record.push_optional("total_mean_precision", mean_of(&lists.precision));
    record.push_optional("total_mean_success", mean_of(&lists.success));
    record.push_optional("total_precision_near", totals.precision_near.average());
    record.push_optional("total_success_near", totals.success_near.average());
    record.push_optional("total_precision_far", totals.precision_far.average());
    record.push_optional("total_success_far", totals.success_far.average());
    record.push_optional("fps", fps);
    record.push("params", params_line(params));
    record.push("object_precisions", totals.object_precisions.clone());
    record.push("object_successes", totals.object_successes.clone());
    record.push_optional("total_precision_same", totals.precision_same.average());
    record.push_optional("total_success_same", totals.success_same.average());
    record.push_optional("total_precision_ideal", totals.precision_ideal.average());
    record.push_optional("total_success_ideal", totals.success_ideal.average());
    record.push_optional("total_precision", totals.precision.average());
    record.push_optional("total_success", totals.success.average());
    record.push("vertical_error", totals.vertical_error.average_or(-1.0));
    record.push(
        "vertical_error_no_regress",
        totals.vertical_error_no_regress.average_or(-1.0),
    );
    record.push("all_vertical_error", totals.all_vertical_error.clone());
    record.push(
        "all_vertical_error_no_regress",
        totals.all_vertical_error_no_regress.clone(),
    );
    if let Some((total, dropped)) = frame_counts {
        record.push("total_frames", total);
        record.push("dropped_frames", dropped);
    }
    record.push("all_iou3ds", lists.iou3ds.clone());
    record.push("all_iouAabbs", lists.iou_aabbs.clone());
    record.push("all_tracked", lists.tracked.clone());
    record.push("all_precision", lists.precision.clone());
    record.push("all_success", lists.success.clone());
    record.push("tracks", tracks.to_vec());
    record
}
