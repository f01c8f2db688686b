use anyhow::{Context, Result};
use serde_json::Value;
use sot_core::{atomic_write_string, format_float};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    pairs: Vec<(String, Value)>,
}

impl ResultRecord {
    pub fn new() -> Self {
        ResultRecord::default()
    }

    pub fn push(&mut self, key: &str, value: impl Into<Value>) {
        self.pairs.push((key.to_string(), value.into()));
    }

    pub fn push_optional(&mut self, key: &str, value: Option<f64>) {
        match value {
            Some(v) => self.push(key, v),
            None => self.push(key, Value::Null),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn pairs(&self) -> &[(String, Value)] {
        &self.pairs
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.pairs {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&format_report_value(value, false));
            out.push('\n');
        }
        out
    }
}

fn format_report_value(value: &Value, nested: bool) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                format_float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => {
            if nested {
                format!("'{}'", s)
            } else {
                s.clone()
            }
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| format_report_value(item, true))
                .collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(_) => value.to_string(),
    }
}

pub fn write_report(path: &Path, record: &ResultRecord) -> Result<()> {
    atomic_write_string(path, &record.render())
        .with_context(|| format!("report_write_failed: {}", path.display()))
}

pub fn read_report_lines(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("report_unreadable: {}", path.display()))?;
    let mut lines = Vec::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(" = ") {
            lines.push((key.to_string(), value.to_string()));
        }
    }
    Ok(lines)
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub name_filters: Vec<String>,
    pub file_filter: Option<String>,
    pub tracks: Option<Vec<String>>,
    pub sort_by: String,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            name_filters: Vec::new(),
            file_filter: None,
            tracks: None,
            sort_by: "total_success".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedRow {
    pub path: PathBuf,
    pub config_name: String,
    pub values: BTreeMap<String, f64>,
}

impl CollectedRow {
    pub fn metric(&self, key: &str) -> f64 {
        self.values.get(key).copied().unwrap_or(-1.0)
    }
}

fn tracks_match(raw: &str, wanted: &[String]) -> bool {
    if wanted.len() != raw.split(',').count() {
        return false;
    }
    wanted.iter().all(|track| raw.contains(track.as_str()))
}

// Rows come back sorted ascending by the chosen metric so the best
// configurations are the last lines printed.
pub fn collect_results(root: &Path, options: &CollectOptions) -> Result<Vec<CollectedRow>> {
    let mut rows = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.starts_with("results_") || !file_name.ends_with(".txt") {
            continue;
        }
        if let Some(filter) = &options.file_filter {
            if !file_name.contains(filter.as_str()) {
                continue;
            }
        }
        let config_name = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !options
            .name_filters
            .iter()
            .all(|f| config_name.contains(f.as_str()))
        {
            continue;
        }
        let lines = match read_report_lines(entry.path()) {
            Ok(lines) => lines,
            Err(error) => {
                warn!(path = %entry.path().display(), %error, "skipping unreadable report");
                continue;
            }
        };
        let by_key: BTreeMap<String, String> = lines.into_iter().collect();
        if let Some(wanted) = &options.tracks {
            match by_key.get("tracks") {
                Some(raw) if tracks_match(raw, wanted) => {}
                _ => continue,
            }
        }
        let mut values = BTreeMap::new();
        for (key, raw) in &by_key {
            if let Ok(parsed) = raw.trim().parse::<f64>() {
                values.insert(key.clone(), parsed);
            }
        }
        rows.push(CollectedRow {
            path: entry.path().to_path_buf(),
            config_name,
            values,
        });
    }
    rows.sort_by(|a, b| {
        let left = a.metric(&options.sort_by);
        let right = b.metric(&options.sort_by);
        left.partial_cmp(&right)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(rows)
}

pub fn render_collected(rows: &[CollectedRow]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "{} precision {} success {} iou3d {} fps {}\n",
            row.path.display(),
            format_float(row.metric("total_precision")),
            format_float(row.metric("total_success")),
            format_float(row.metric("total_mean_iou3d")),
            format_float(row.metric("fps")),
        ));
    }
    out
}
