use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBox {
    pub name: String,
    pub location: [f64; 3],
    pub dimensions: [f64; 3],
    pub rotation_y: f64,
    pub id: i64,
    pub frame: usize,
}

impl TrackedBox {
    pub fn new(name: &str, location: [f64; 3], dimensions: [f64; 3], id: i64, frame: usize) -> Self {
        TrackedBox {
            name: name.to_string(),
            location,
            dimensions,
            rotation_y: 0.0,
            id,
            frame,
        }
    }

    pub fn range(&self) -> f64 {
        (self.location[0] * self.location[0]
            + self.location[1] * self.location[1]
            + self.location[2] * self.location[2])
            .sqrt()
    }

    pub fn with_vertical_from(&self, other: &TrackedBox) -> TrackedBox {
        let mut out = self.clone();
        out.location[2] = other.location[2];
        out
    }

    pub fn nudged(&self, delta: f64) -> TrackedBox {
        let mut out = self.clone();
        for v in out.location.iter_mut() {
            *v += delta;
        }
        for v in out.dimensions.iter_mut() {
            *v += delta;
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: usize,
    pub labels: Vec<TrackedBox>,
}

impl FrameRecord {
    pub fn label_for(&self, object_id: i64) -> Option<&TrackedBox> {
        self.labels.iter().find(|l| l.id == object_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Json(Value),
}

impl ParamValue {
    pub fn parse_literal(text: &str) -> ParamValue {
        let trimmed = text.trim();
        if trimmed == "true" {
            return ParamValue::Bool(true);
        }
        if trimmed == "false" {
            return ParamValue::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return ParamValue::Float(f);
        }
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
                return ParamValue::Json(v);
            }
        }
        ParamValue::Str(trimmed.to_string())
    }

    pub fn from_json(value: &Value) -> ParamValue {
        match value {
            Value::Bool(b) => ParamValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ParamValue::Int(i)
                } else {
                    ParamValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => ParamValue::Str(s.clone()),
            other => ParamValue::Json(other.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Int(i) => Value::from(*i),
            ParamValue::Float(f) => Value::from(*f),
            ParamValue::Bool(b) => Value::from(*b),
            ParamValue::Str(s) => Value::from(s.as_str()),
            ParamValue::Json(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(ParamValue::from_json(&value))
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", format_float(*v)),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Json(v) => write!(f, "{}", v),
        }
    }
}

// Floats always render with a decimal point so a re-parse cannot demote
// them to integers.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

fn axis_overlap(center_a: f64, size_a: f64, center_b: f64, size_b: f64) -> f64 {
    let min_a = center_a - size_a / 2.0;
    let max_a = center_a + size_a / 2.0;
    let min_b = center_b - size_b / 2.0;
    let max_b = center_b + size_b / 2.0;
    (max_a.min(max_b) - min_a.max(min_b)).max(0.0)
}

pub fn aabb_iou_3d(a: &TrackedBox, b: &TrackedBox) -> f64 {
    let mut inter = 1.0;
    for axis in 0..3 {
        inter *= axis_overlap(
            a.location[axis],
            a.dimensions[axis],
            b.location[axis],
            b.dimensions[axis],
        );
    }
    let vol_a = a.dimensions.iter().product::<f64>();
    let vol_b = b.dimensions.iter().product::<f64>();
    let union = vol_a + vol_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

pub fn aabb_iou_bev(a: &TrackedBox, b: &TrackedBox) -> f64 {
    let inter = axis_overlap(a.location[0], a.dimensions[0], b.location[0], b.dimensions[0])
        * axis_overlap(a.location[1], a.dimensions[1], b.location[1], b.dimensions[1]);
    let area_a = a.dimensions[0] * a.dimensions[1];
    let area_b = b.dimensions[0] * b.dimensions[1];
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

pub fn center_error(a: &TrackedBox, b: &TrackedBox) -> f64 {
    let dx = a.location[0] - b.location[0];
    let dy = a.location[1] - b.location[1];
    let dz = a.location[2] - b.location[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

pub fn vertical_error(a: &TrackedBox, b: &TrackedBox) -> f64 {
    (a.location[2] - b.location[2]).abs()
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_string(path: &Path, text: &str) -> Result<()> {
    atomic_write_bytes(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(location: [f64; 3], dimensions: [f64; 3]) -> TrackedBox {
        TrackedBox::new("Car", location, dimensions, 0, 0)
    }

    #[test]
    fn identical_boxes_overlap_fully() {
        let a = car([1.0, 2.0, 0.5], [4.0, 2.0, 1.5]);
        let iou = aabb_iou_3d(&a, &a);
        assert!((iou - 1.0).abs() < 1e-12);
        assert!((aabb_iou_bev(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disjoint_boxes_overlap_zero() {
        let a = car([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        let b = car([10.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        assert_eq!(aabb_iou_3d(&a, &b), 0.0);
    }

    #[test]
    fn half_shifted_boxes_overlap_third() {
        let a = car([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        let b = car([1.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        // intersection 4, union 12
        assert!((aabb_iou_3d(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn center_error_is_euclidean() {
        let a = car([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = car([3.0, 4.0, 0.0], [1.0, 1.0, 1.0]);
        assert!((center_error(&a, &b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn float_display_keeps_decimal_point() {
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(0.35), "0.35");
        assert_eq!(format_float(-0.5), "-0.5");
    }

    #[test]
    fn param_value_display_reparses_to_same_value() {
        let cases = vec![
            ParamValue::Int(16),
            ParamValue::Float(0.45),
            ParamValue::Float(2.0),
            ParamValue::Bool(true),
            ParamValue::Str("normal".to_string()),
            ParamValue::Json(serde_json::json!([127, 127, 1])),
        ];
        for value in cases {
            let rendered = value.to_string();
            let parsed = ParamValue::parse_literal(&rendered);
            assert_eq!(parsed, value, "round trip for {}", rendered);
        }
    }

    #[test]
    fn atomic_write_replaces_content() {
        let root = std::env::temp_dir().join(format!(
            "sot_core_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("out.txt");
        atomic_write_string(&path, "first").unwrap();
        atomic_write_string(&path, "second").unwrap();
        let read = fs::read_to_string(&path).unwrap();
        assert_eq!(read, "second");
        let leftovers: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        fs::remove_dir_all(&root).ok();
    }
}
