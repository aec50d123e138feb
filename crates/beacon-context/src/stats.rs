//! Per-context counters and gauges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// A single recorded metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric: String,
    pub value: f64,
    pub kind: MetricKind,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Metrics recorded while a context travels the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    metrics: Vec<Metric>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to a counter.
    pub fn increment(&mut self, metric: &str, by: f64, tags: &[String]) {
        self.record(metric, by, MetricKind::Counter, tags);
    }

    /// Record a point-in-time value (e.g., a duration in milliseconds).
    pub fn gauge(&mut self, metric: &str, value: f64, tags: &[String]) {
        self.record(metric, value, MetricKind::Gauge, tags);
    }

    fn record(&mut self, metric: &str, value: f64, kind: MetricKind, tags: &[String]) {
        self.metrics.push(Metric {
            metric: metric.to_string(),
            value,
            kind,
            tags: tags.to_vec(),
            timestamp: Utc::now(),
        });
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Sum of all counter samples for `metric`, optionally restricted to a tag.
    pub fn counter(&self, metric: &str, tag: Option<&str>) -> f64 {
        self.samples(metric, MetricKind::Counter, tag).sum()
    }

    /// All gauge samples for `metric`, optionally restricted to a tag.
    pub fn gauges(&self, metric: &str, tag: Option<&str>) -> Vec<f64> {
        self.samples(metric, MetricKind::Gauge, tag).collect()
    }

    fn samples<'a>(
        &'a self,
        metric: &'a str,
        kind: MetricKind,
        tag: Option<&'a str>,
    ) -> impl Iterator<Item = f64> + 'a {
        self.metrics
            .iter()
            .filter(move |m| m.metric == metric && m.kind == kind)
            .filter(move |m| tag.map_or(true, |t| m.tags.iter().any(|mt| mt == t)))
            .map(|m| m.value)
    }

    /// Append samples recorded elsewhere (e.g. on a copy of the same context).
    pub fn merge(&mut self, metrics: impl IntoIterator<Item = Metric>) {
        self.metrics.extend(metrics);
    }

    /// Drain every recorded metric.
    pub fn flush(&mut self) -> Vec<Metric> {
        std::mem::take(&mut self.metrics)
    }
}
