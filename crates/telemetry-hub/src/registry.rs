//! Per-service metric registry.
//!
//! Each registered service owns one [`MetricRegistry`]. Metrics are defined
//! up front with a fixed label schema and observed through cheap, cloneable
//! handles. The registry renders a Prometheus text snapshot on demand.
//!
//! # Naming
//!
//! Metric names are prefixed with the registry prefix (normally the service
//! name), so `operations_total` defined on `reply_bot` is exposed as
//! `reply_bot_operations_total`. Every series carries the default labels
//! `service`, `environment`, `version` and `instance`.
//!
//! # Determinism
//!
//! Snapshots list metric families sorted by name and series sorted by label
//! values, so two snapshots of unchanged state are byte-identical.

use parking_lot::Mutex;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Duration buckets (seconds) used for operation latency histograms.
pub const DEFAULT_DURATION_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Label names reserved for the default process-level labels.
pub const DEFAULT_LABEL_NAMES: [&str; 4] = ["service", "environment", "version", "instance"];

/// Errors raised when defining or observing metrics.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Metric already defined: {0}")]
    DuplicateMetric(String),

    #[error("Label mismatch for {metric}: expected [{expected}], got [{actual}]")]
    LabelMismatch {
        metric: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid value for {metric}: {value}")]
    InvalidValue { metric: String, value: f64 },

    #[error("Invalid metric definition: {0}")]
    Definition(String),

    #[error("Snapshot encoding failed: {0}")]
    Encoding(String),
}

/// Default labels attached to every series in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLabels {
    pub service: String,
    pub environment: String,
    pub version: String,
    pub instance: String,
}

impl RegistryLabels {
    fn into_map(self) -> HashMap<String, String> {
        HashMap::from([
            ("service".to_string(), self.service),
            ("environment".to_string(), self.environment),
            ("version".to_string(), self.version),
            ("instance".to_string(), self.instance),
        ])
    }
}

/// Kind of a defined metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
    Gauge,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
            MetricKind::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone)]
struct MetricSchema {
    kind: MetricKind,
    label_names: Arc<[String]>,
}

/// Metric registry scoped to one service.
pub struct MetricRegistry {
    prefix: String,
    labels: RegistryLabels,
    registry: Registry,
    schema: Mutex<BTreeMap<String, MetricSchema>>,
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("prefix", &self.prefix)
            .field("labels", &self.labels)
            .field("metrics", &self.schema.lock().len())
            .finish()
    }
}

impl MetricRegistry {
    /// Create a registry whose metric prefix is derived from the service name.
    pub fn new(labels: RegistryLabels) -> Result<Self, RegistryError> {
        let prefix = metric_prefix(&labels.service);
        Self::with_prefix(prefix, labels)
    }

    /// Create a registry with an explicit metric name prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        labels: RegistryLabels,
    ) -> Result<Self, RegistryError> {
        let prefix = prefix.into();
        let registry = Registry::new_custom(Some(prefix.clone()), Some(labels.clone().into_map()))
            .map_err(|e| RegistryError::Definition(e.to_string()))?;

        Ok(Self {
            prefix,
            labels,
            registry,
            schema: Mutex::new(BTreeMap::new()),
        })
    }

    /// Metric name prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Default labels attached to every series.
    #[must_use]
    pub fn labels(&self) -> &RegistryLabels {
        &self.labels
    }

    /// Number of metrics defined in this registry.
    #[must_use]
    pub fn metrics_count(&self) -> usize {
        self.schema.lock().len()
    }

    /// Kind of a defined metric, if any.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.schema.lock().get(name).map(|s| s.kind)
    }

    /// Define a monotonically increasing counter.
    pub fn define_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterHandle, RegistryError> {
        let mut schema = self.schema.lock();
        let label_names = self.check_definition(&schema, name, label_names)?;

        let vec = CounterVec::new(Opts::new(name, help), &as_strs(&label_names))
            .map_err(|e| RegistryError::Definition(format!("{name}: {e}")))?;
        self.register(name, Box::new(vec.clone()))?;

        schema.insert(
            name.to_string(),
            MetricSchema {
                kind: MetricKind::Counter,
                label_names: Arc::clone(&label_names),
            },
        );

        Ok(CounterHandle {
            name: name.to_string(),
            label_names,
            inner: vec,
        })
    }

    /// Define a bucketed histogram.
    pub fn define_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Result<HistogramHandle, RegistryError> {
        let mut schema = self.schema.lock();
        let label_names = self.check_definition(&schema, name, label_names)?;

        if buckets.windows(2).any(|w| matches!(w, [a, b] if a >= b)) {
            return Err(RegistryError::Definition(format!(
                "{name}: buckets must be strictly increasing"
            )));
        }

        let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
        let vec = HistogramVec::new(opts, &as_strs(&label_names))
            .map_err(|e| RegistryError::Definition(format!("{name}: {e}")))?;
        self.register(name, Box::new(vec.clone()))?;

        schema.insert(
            name.to_string(),
            MetricSchema {
                kind: MetricKind::Histogram,
                label_names: Arc::clone(&label_names),
            },
        );

        Ok(HistogramHandle {
            name: name.to_string(),
            label_names,
            inner: vec,
        })
    }

    /// Define a point-in-time gauge.
    pub fn define_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<GaugeHandle, RegistryError> {
        let mut schema = self.schema.lock();
        let label_names = self.check_definition(&schema, name, label_names)?;

        let vec = GaugeVec::new(Opts::new(name, help), &as_strs(&label_names))
            .map_err(|e| RegistryError::Definition(format!("{name}: {e}")))?;
        self.register(name, Box::new(vec.clone()))?;

        schema.insert(
            name.to_string(),
            MetricSchema {
                kind: MetricKind::Gauge,
                label_names: Arc::clone(&label_names),
            },
        );

        Ok(GaugeHandle {
            name: name.to_string(),
            label_names,
            inner: vec,
        })
    }

    /// Render every defined metric in Prometheus text format.
    pub fn snapshot(&self) -> Result<String, RegistryError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| RegistryError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| RegistryError::Encoding(e.to_string()))
    }

    fn check_definition(
        &self,
        schema: &BTreeMap<String, MetricSchema>,
        name: &str,
        label_names: &[&str],
    ) -> Result<Arc<[String]>, RegistryError> {
        if schema.contains_key(name) {
            return Err(RegistryError::DuplicateMetric(name.to_string()));
        }

        if let Some(reserved) = label_names
            .iter()
            .find(|l| DEFAULT_LABEL_NAMES.contains(l))
        {
            return Err(RegistryError::Definition(format!(
                "{name}: label '{reserved}' is reserved for default labels"
            )));
        }

        let mut seen = label_names.to_vec();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != label_names.len() {
            return Err(RegistryError::Definition(format!(
                "{name}: duplicate label names"
            )));
        }

        Ok(label_names.iter().map(|l| (*l).to_string()).collect())
    }

    fn register(
        &self,
        name: &str,
        collector: Box<dyn prometheus::core::Collector>,
    ) -> Result<(), RegistryError> {
        self.registry.register(collector).map_err(|e| match e {
            prometheus::Error::AlreadyReg => RegistryError::DuplicateMetric(name.to_string()),
            other => RegistryError::Definition(format!("{name}: {other}")),
        })
    }
}

/// Derive a valid metric name prefix from a service name.
///
/// Lowercases, replaces characters outside `[a-z0-9_]` with `_`, and guards
/// against a leading digit.
#[must_use]
pub fn metric_prefix(service: &str) -> String {
    let mut prefix: String = service
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if prefix.is_empty() || prefix.starts_with(|c: char| c.is_ascii_digit()) {
        prefix.insert(0, '_');
    }
    prefix
}

fn as_strs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

/// Validate observation labels against the defined schema.
fn resolve_labels<'a>(
    metric: &str,
    expected: &[String],
    labels: &[(&'a str, &'a str)],
) -> Result<HashMap<&'a str, &'a str>, RegistryError> {
    let map: HashMap<&str, &str> = labels.iter().copied().collect();

    let matches = map.len() == labels.len()
        && map.len() == expected.len()
        && expected.iter().all(|name| map.contains_key(name.as_str()));

    if !matches {
        let mut actual: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        actual.sort_unstable();
        return Err(RegistryError::LabelMismatch {
            metric: metric.to_string(),
            expected: expected.join(","),
            actual: actual.join(","),
        });
    }

    Ok(map)
}

fn mismatch(metric: &str, expected: &[String], err: &prometheus::Error) -> RegistryError {
    RegistryError::LabelMismatch {
        metric: metric.to_string(),
        expected: expected.join(","),
        actual: err.to_string(),
    }
}

/// Handle to a defined counter.
#[derive(Clone)]
pub struct CounterHandle {
    name: String,
    label_names: Arc<[String]>,
    inner: CounterVec,
}

impl CounterHandle {
    /// Increment the series identified by `labels` by `amount` (default 1).
    pub fn increment(
        &self,
        labels: &[(&str, &str)],
        amount: Option<f64>,
    ) -> Result<(), RegistryError> {
        let amount = amount.unwrap_or(1.0);
        if !amount.is_finite() || amount < 0.0 {
            return Err(RegistryError::InvalidValue {
                metric: self.name.clone(),
                value: amount,
            });
        }

        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        self.inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .inc_by(amount);
        Ok(())
    }

    /// Current value of a series (0 when it has never been observed).
    pub fn value(&self, labels: &[(&str, &str)]) -> Result<f64, RegistryError> {
        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        Ok(self
            .inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .get())
    }
}

/// Handle to a defined histogram.
#[derive(Clone)]
pub struct HistogramHandle {
    name: String,
    label_names: Arc<[String]>,
    inner: HistogramVec,
}

impl HistogramHandle {
    /// Record one observation.
    pub fn observe(&self, labels: &[(&str, &str)], value: f64) -> Result<(), RegistryError> {
        if !value.is_finite() {
            return Err(RegistryError::InvalidValue {
                metric: self.name.clone(),
                value,
            });
        }

        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        self.inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .observe(value);
        Ok(())
    }

    /// Number of observations recorded for a series.
    pub fn sample_count(&self, labels: &[(&str, &str)]) -> Result<u64, RegistryError> {
        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        Ok(self
            .inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .get_sample_count())
    }
}

/// Handle to a defined gauge.
#[derive(Clone)]
pub struct GaugeHandle {
    name: String,
    label_names: Arc<[String]>,
    inner: GaugeVec,
}

impl GaugeHandle {
    /// Set the series identified by `labels` to `value`.
    pub fn set(&self, labels: &[(&str, &str)], value: f64) -> Result<(), RegistryError> {
        if !value.is_finite() {
            return Err(RegistryError::InvalidValue {
                metric: self.name.clone(),
                value,
            });
        }

        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        self.inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .set(value);
        Ok(())
    }

    /// Current value of a series.
    pub fn value(&self, labels: &[(&str, &str)]) -> Result<f64, RegistryError> {
        let map = resolve_labels(&self.name, &self.label_names, labels)?;
        Ok(self
            .inner
            .get_metric_with(&map)
            .map_err(|e| mismatch(&self.name, &self.label_names, &e))?
            .get())
    }
}
