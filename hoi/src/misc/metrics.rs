use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named scalar results of one training or evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochStats(BTreeMap<String, f64>);

impl EpochStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON entries keyed `{prefix}_{name}`, as written to the epoch log.
    pub fn prefixed(&self, prefix: &str) -> Map<String, Value> {
        self.iter()
            .map(|(key, value)| (format!("{prefix}_{key}"), Value::from(value)))
            .collect()
    }
}

impl FromIterator<(String, f64)> for EpochStats {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Running sample-weighted averages, reported once per epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, (f64, usize)>,
}

impl MetricLogger {
    pub fn update(&mut self, key: &str, value: f64, n: usize) {
        let meter = self.meters.entry(key.to_string()).or_insert((0.0, 0));
        meter.0 += value * n as f64;
        meter.1 += n;
    }

    pub fn global_avg(&self, key: &str) -> Option<f64> {
        self.meters
            .get(key)
            .filter(|(_, count)| *count > 0)
            .map(|(total, count)| total / *count as f64)
    }

    pub fn summary(&self) -> EpochStats {
        self.meters
            .keys()
            .filter_map(|key| self.global_avg(key).map(|avg| (key.clone(), avg)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_keys_match_log_layout() {
        let stats = EpochStats::new().with("loss", 1.5).with("mAP", 0.25);
        let map = stats.prefixed("test");
        assert_eq!(map.get("test_mAP"), Some(&Value::from(0.25)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn logger_weights_by_sample_count() {
        let mut logger = MetricLogger::default();
        logger.update("loss", 1.0, 1);
        logger.update("loss", 4.0, 3);
        assert_eq!(logger.global_avg("loss"), Some(3.25));
        assert_eq!(logger.summary().get("loss"), Some(3.25));
        assert_eq!(logger.global_avg("missing"), None);
    }
}
