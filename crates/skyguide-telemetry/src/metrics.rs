use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Type of metric.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one series. Histograms report their p50.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub metric_type: MetricType,
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Observations kept per histogram series; older ones are evicted.
const HISTOGRAM_WINDOW: usize = 4096;

/// One series: a metric name plus a label set, sorted by label key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    metric_type: MetricType,
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(metric_type: MetricType, name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            metric_type,
            name: name.to_owned(),
            labels,
        }
    }
}

enum Cell {
    Counter(AtomicU64),
    // f64 bit pattern
    Gauge(AtomicU64),
    Histogram(Mutex<VecDeque<f64>>),
}

impl Cell {
    fn empty(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Counter => Cell::Counter(AtomicU64::new(0)),
            MetricType::Gauge => Cell::Gauge(AtomicU64::new(0f64.to_bits())),
            MetricType::Histogram => Cell::Histogram(Mutex::new(VecDeque::new())),
        }
    }

    fn value(&self) -> f64 {
        match self {
            Cell::Counter(n) => n.load(Ordering::Relaxed) as f64,
            Cell::Gauge(bits) => f64::from_bits(bits.load(Ordering::Relaxed)),
            Cell::Histogram(window) => summarize(&window.lock()).p50,
        }
    }
}

fn summarize(window: &VecDeque<f64>) -> HistogramSummary {
    if window.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let count = sorted.len();
    let rank = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
    HistogramSummary {
        count: count as u64,
        sum: sorted.iter().sum(),
        p50: rank(0.5),
        p95: rank(0.95),
        p99: rank(0.99),
    }
}

/// Thread-safe in-process metrics recorder.
///
/// Series are created on first use. Updates to an existing series only
/// take the table's read lock.
#[derive(Default)]
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Cell>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, key: SeriesKey, f: impl FnOnce(&Cell)) {
        if let Some(cell) = self.series.read().get(&key) {
            f(cell);
            return;
        }
        let mut series = self.series.write();
        let cell = series
            .entry(key)
            .or_insert_with_key(|k| Cell::empty(k.metric_type));
        f(cell);
    }

    fn read<R>(&self, key: &SeriesKey, f: impl FnOnce(&Cell) -> R) -> Option<R> {
        self.series.read().get(key).map(f)
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.update(SeriesKey::new(MetricType::Counter, name, labels), |cell| {
            if let Cell::Counter(c) = cell {
                c.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.update(SeriesKey::new(MetricType::Gauge, name, labels), |cell| {
            if let Cell::Gauge(bits) = cell {
                bits.store(value.to_bits(), Ordering::Relaxed);
            }
        });
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.update(SeriesKey::new(MetricType::Gauge, name, labels), |cell| {
            if let Cell::Gauge(bits) = cell {
                let _ = bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                    Some((f64::from_bits(cur) + delta).to_bits())
                });
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.update(SeriesKey::new(MetricType::Histogram, name, labels), |cell| {
            if let Cell::Histogram(window) = cell {
                let mut window = window.lock();
                if window.len() == HISTOGRAM_WINDOW {
                    window.pop_front();
                }
                window.push_back(value);
            }
        });
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = SeriesKey::new(MetricType::Histogram, name, labels);
        self.read(&key, |cell| match cell {
            Cell::Histogram(window) => summarize(&window.lock()),
            _ => HistogramSummary::default(),
        })
        .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(MetricType::Counter, name, labels);
        self.read(&key, |cell| cell.value() as u64).unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = SeriesKey::new(MetricType::Gauge, name, labels);
        self.read(&key, Cell::value).unwrap_or(0.0)
    }

    /// Current value of every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .series
            .read()
            .iter()
            .map(|(key, cell)| MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: cell.value(),
                metric_type: key.metric_type,
            })
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}
