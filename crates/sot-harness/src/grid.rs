use crate::HarnessError;
use serde::{Deserialize, Serialize};
use sot_core::ParamValue;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
}

impl Candidate {
    pub fn plain(value: ParamValue) -> Self {
        Candidate { value, short: None }
    }

    pub fn tagged(value: ParamValue, short: &str) -> Self {
        Candidate {
            value,
            short: Some(short.to_string()),
        }
    }

    fn name_tag(&self) -> String {
        let raw = match &self.short {
            Some(short) => short.clone(),
            None => self.value.to_string(),
        };
        sanitize_tag(&raw)
    }
}

// Names are used as path fragments and report keys.
fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            '.' => None,
            '/' | '\\' => Some('-'),
            c if c.is_whitespace() => Some('-'),
            c => Some(c),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridParam {
    pub name: String,
    pub tag: String,
    pub candidates: Vec<Candidate>,
}

impl GridParam {
    pub fn new(name: &str, tag: &str, candidates: Vec<Candidate>) -> Self {
        GridParam {
            name: name.to_string(),
            tag: tag.to_string(),
            candidates,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterGrid {
    params: Vec<GridParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigKey {
    pairs: Vec<(String, ParamValue)>,
}

impl ConfigKey {
    pub fn from_pairs(pairs: Vec<(String, ParamValue)>) -> Self {
        ConfigKey { pairs }
    }

    pub fn pairs(&self) -> &[(String, ParamValue)] {
        &self.pairs
    }

    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.pairs {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(&value.to_string());
        }
        out
    }

    pub fn with_overrides(&self, overrides: &[(String, ParamValue)]) -> ConfigKey {
        let mut pairs = self.pairs.clone();
        for (name, value) in overrides {
            match pairs.iter_mut().find(|(key, _)| key == name) {
                Some(slot) => slot.1 = value.clone(),
                None => pairs.push((name.clone(), value.clone())),
            }
        }
        ConfigKey { pairs }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub key: ConfigKey,
    pub name: String,
}

impl SweepConfig {
    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.key.value(name)
    }

    pub fn canonical(&self) -> String {
        self.key.canonical()
    }

    pub fn with_overrides(&self, overrides: &[(String, ParamValue)]) -> SweepConfig {
        SweepConfig {
            key: self.key.with_overrides(overrides),
            name: self.name.clone(),
        }
    }
}

impl ParameterGrid {
    pub fn new() -> Self {
        ParameterGrid::default()
    }

    pub fn push(&mut self, param: GridParam) {
        self.params.push(param);
    }

    pub fn with(mut self, name: &str, tag: &str, candidates: Vec<Candidate>) -> Self {
        self.push(GridParam::new(name, tag, candidates));
        self
    }

    pub fn params(&self) -> &[GridParam] {
        &self.params
    }

    fn validate(&self) -> Result<(), HarnessError> {
        let mut seen = BTreeSet::new();
        for param in &self.params {
            if param.candidates.is_empty() {
                return Err(HarnessError::configuration(format!(
                    "empty candidate list for parameter '{}'",
                    param.name
                )));
            }
            if !seen.insert(param.name.clone()) {
                return Err(HarnessError::configuration(format!(
                    "duplicate parameter '{}'",
                    param.name
                )));
            }
        }
        Ok(())
    }

    // Cartesian product in declared order: the first parameter varies
    // slowest, the last varies fastest.
    pub fn build(&self) -> Result<Vec<SweepConfig>, HarnessError> {
        self.validate()?;
        if self.params.is_empty() {
            return Ok(Vec::new());
        }
        let mut configs = Vec::new();
        let mut cursor = vec![0usize; self.params.len()];
        loop {
            let mut pairs = Vec::with_capacity(self.params.len());
            let mut fragments = Vec::with_capacity(self.params.len());
            for (param, &index) in self.params.iter().zip(cursor.iter()) {
                let candidate = &param.candidates[index];
                pairs.push((param.name.clone(), candidate.value.clone()));
                fragments.push(format!("{}{}", sanitize_tag(&param.tag), candidate.name_tag()));
            }
            configs.push(SweepConfig {
                key: ConfigKey::from_pairs(pairs),
                name: fragments.join("-"),
            });

            let mut position = self.params.len();
            loop {
                if position == 0 {
                    return Ok(configs);
                }
                position -= 1;
                cursor[position] += 1;
                if cursor[position] < self.params[position].candidates.len() {
                    break;
                }
                cursor[position] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_candidates(values: &[f64]) -> Vec<Candidate> {
        values
            .iter()
            .map(|v| Candidate::plain(ParamValue::Float(*v)))
            .collect()
    }

    #[test]
    fn cartesian_product_is_complete_and_distinct() {
        let grid = ParameterGrid::new()
            .with("rotation_penalty", "rp", float_candidates(&[0.98, 0.96]))
            .with(
                "rotations_count",
                "rc",
                vec![
                    Candidate::plain(ParamValue::Int(3)),
                    Candidate::plain(ParamValue::Int(5)),
                ],
            )
            .with("rotation_step", "rs", float_candidates(&[0.15, 0.1, 0.075]));
        let configs = grid.build().unwrap();
        assert_eq!(configs.len(), 12);
        let canonical: BTreeSet<String> = configs.iter().map(|c| c.canonical()).collect();
        assert_eq!(canonical.len(), 12);
        let names: BTreeSet<String> = configs.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn rebuild_produces_identical_names_in_identical_order() {
        let make = || {
            ParameterGrid::new()
                .with("window_influence", "wi", float_candidates(&[0.35, 0.45]))
                .with(
                    "score_upscale",
                    "su",
                    vec![
                        Candidate::plain(ParamValue::Int(8)),
                        Candidate::plain(ParamValue::Int(16)),
                    ],
                )
        };
        let first: Vec<String> = make().build().unwrap().into_iter().map(|c| c.name).collect();
        let second: Vec<String> = make().build().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn declared_order_drives_iteration_order() {
        let grid = ParameterGrid::new()
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
            );
        let names: Vec<String> = grid.build().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a1-bx", "a1-by", "a2-bx", "a2-by"]);
    }

    #[test]
    fn empty_candidate_list_is_a_configuration_error() {
        let grid = ParameterGrid::new().with("rotation_step", "rs", Vec::new());
        let err = grid.build().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(err.to_string().contains("rotation_step"));
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let grid = ParameterGrid::new()
            .with("lr", "lr", float_candidates(&[0.1]))
            .with("lr", "lr2", float_candidates(&[0.2]));
        assert!(matches!(
            grid.build().unwrap_err(),
            HarnessError::Configuration(_)
        ));
    }

    #[test]
    fn name_tags_strip_dots_and_use_short_names() {
        let grid = ParameterGrid::new()
            .with("rotation_step", "rs", float_candidates(&[0.075]))
            .with(
                "search_type",
                "s",
                vec![Candidate::tagged(
                    ParamValue::Str("normal".to_string()),
                    "n",
                )],
            );
        let configs = grid.build().unwrap();
        assert_eq!(configs[0].name, "rs0075-sn");
        assert_eq!(
            configs[0].value("search_type"),
            Some(&ParamValue::Str("normal".to_string()))
        );
    }

    #[test]
    fn identity_survives_display_tag_collisions() {
        // Same display tags for both parameters: names collide, canonical
        // keys must not.
        let grid = ParameterGrid::new()
            .with(
                "alpha",
                "x",
                vec![
                    Candidate::tagged(ParamValue::Int(1), "1"),
                    Candidate::tagged(ParamValue::Int(12), "12"),
                ],
            )
            .with(
                "beta",
                "x",
                vec![
                    Candidate::tagged(ParamValue::Int(21), "21"),
                    Candidate::tagged(ParamValue::Int(2), "2"),
                ],
            );
        let configs = grid.build().unwrap();
        let canonical: BTreeSet<String> = configs.iter().map(|c| c.canonical()).collect();
        assert_eq!(canonical.len(), 4);
    }

    #[test]
    fn overrides_replace_and_extend_pairs() {
        let grid = ParameterGrid::new().with("window_influence", "wi", float_candidates(&[0.35]));
        let config = grid.build().unwrap().remove(0);
        let merged = config.with_overrides(&[
            ("window_influence".to_string(), ParamValue::Float(0.45)),
            ("score_upscale".to_string(), ParamValue::Int(16)),
        ]);
        assert_eq!(
            merged.value("window_influence"),
            Some(&ParamValue::Float(0.45))
        );
        assert_eq!(merged.value("score_upscale"), Some(&ParamValue::Int(16)));
        assert_eq!(merged.name, config.name);
    }
}
