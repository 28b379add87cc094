use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::measurement::Measurement;

/// Kind of a buffered metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Durations, in milliseconds.
    Timer,

    /// Occurrence counts.
    Counter,

    /// Point-in-time values.
    Gauge,
}

impl MetricKind {
    /// Returns the wire name of the metric kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Timer => "timer",
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Metrics accumulated by an account between flushes.
///
/// # Behavior
///
/// - Timers hold the last value written for each fully-qualified name. Nested measurements are flattened into dotted
///   paths before being stored.
/// - Counters are summed.
/// - Gauges maintain standard "last write wins" behavior.
///
/// Writes with an empty name are ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricBuffer {
    timers: BTreeMap<String, f64>,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

impl MetricBuffer {
    /// Creates an empty `MetricBuffer`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a timing value, flattening nested measurements into `name.sub` entries.
    pub fn add_timing<M: Into<Measurement>>(&mut self, name: &str, value: M) {
        if name.is_empty() {
            return;
        }

        let timers = &mut self.timers;
        value.into().flatten(name, &mut |key, v| {
            timers.insert(key, v);
        });
    }

    /// Increments a counter by one.
    pub fn increment(&mut self, name: &str) {
        self.increment_by(name, 1);
    }

    /// Increments each named counter by one.
    ///
    /// A name that appears several times is incremented once per appearance.
    pub fn increment_all<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.increment(name.as_ref());
        }
    }

    /// Increments a counter by `value`.
    pub fn increment_by(&mut self, name: &str, value: u64) {
        if name.is_empty() {
            return;
        }

        let counter = self.counters.entry(name.to_owned()).or_insert(0);
        *counter = counter.saturating_add(value);
    }

    /// Sets a counter to an absolute value.
    pub fn set_counter(&mut self, name: &str, value: u64) {
        if name.is_empty() {
            return;
        }

        self.counters.insert(name.to_owned(), value);
    }

    /// Sets a gauge.
    pub fn gauge(&mut self, name: &str, value: f64) {
        if name.is_empty() {
            return;
        }

        self.gauges.insert(name.to_owned(), value);
    }

    /// Adjusts a gauge relative to its current value, starting from zero.
    pub fn adjust_gauge(&mut self, name: &str, delta: f64) {
        if name.is_empty() {
            return;
        }

        *self.gauges.entry(name.to_owned()).or_insert(0.0) += delta;
    }

    /// Empties all three mappings.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.counters.clear();
        self.gauges.clear();
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty() && self.counters.is_empty() && self.gauges.is_empty()
    }

    /// Returns the number of distinct buffered names across all kinds.
    pub fn len(&self) -> usize {
        self.timers.len() + self.counters.len() + self.gauges.len()
    }

    /// Returns the buffered timers.
    pub fn timers(&self) -> &BTreeMap<String, f64> {
        &self.timers
    }

    /// Returns the buffered counters.
    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    /// Returns the buffered gauges.
    pub fn gauges(&self) -> &BTreeMap<String, f64> {
        &self.gauges
    }

    /// Returns the buffered values of one kind as a measurement breakdown, or `None` if nothing of that kind is
    /// buffered.
    pub(crate) fn to_measurement(&self, kind: MetricKind) -> Option<Measurement> {
        let group = match kind {
            MetricKind::Timer => Measurement::group(self.timers.iter().map(|(k, v)| (k.clone(), *v))),
            MetricKind::Counter => Measurement::group(self.counters.iter().map(|(k, v)| (k.clone(), *v))),
            MetricKind::Gauge => Measurement::group(self.gauges.iter().map(|(k, v)| (k.clone(), *v))),
        };

        if group.is_empty() {
            None
        } else {
            Some(group)
        }
    }
}
