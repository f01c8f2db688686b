#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingMetric {
    sum: f64,
    count: u64,
}

impl StreamingMetric {
    pub fn new() -> Self {
        StreamingMetric::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn average_or(&self, sentinel: f64) -> f64 {
        self.average().unwrap_or(sentinel)
    }
}

pub fn mean_of_present(values: &[Option<f64>]) -> Option<f64> {
    let mut metric = StreamingMetric::new();
    for value in values.iter().flatten() {
        metric.add(*value);
    }
    metric.average()
}

pub fn mean_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_binary_series() {
        let mut metric = StreamingMetric::new();
        for value in [1.0, 0.0, 1.0, 1.0] {
            metric.add(value);
        }
        assert_eq!(metric.average(), Some(0.75));
        assert_eq!(metric.count(), 4);
    }

    #[test]
    fn empty_metric_reports_sentinel() {
        let metric = StreamingMetric::new();
        assert_eq!(metric.average(), None);
        assert_eq!(metric.average_or(-1.0), -1.0);
    }

    #[test]
    fn mean_skips_missing_children() {
        let values = vec![Some(0.5), None, Some(1.0)];
        assert_eq!(mean_of_present(&values), Some(0.75));
    }

    #[test]
    fn mean_of_no_children_is_none() {
        assert_eq!(mean_of_present(&[None, None]), None);
        assert_eq!(mean_of_present(&[]), None);
        assert_eq!(mean_of(&[]), None);
    }

    #[test]
    fn running_average_tracks_long_series() {
        let mut metric = StreamingMetric::new();
        for i in 0..1000 {
            metric.add(i as f64);
        }
        assert_eq!(metric.average(), Some(499.5));
    }
}
