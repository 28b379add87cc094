use std::{fmt, mem};

pub(crate) const SMALLEST_VALID_PAYLOAD: &[u8] = b"a:0|c";

/// Largest integer that an `f64` represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Statsd metric type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricType {
    /// A duration in milliseconds (`|ms`).
    Timing,

    /// A counter increment (`|c`).
    Counter,

    /// A gauge (`|g`).
    Gauge,
}

impl MetricType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Timing => b"|ms",
            MetricType::Counter => b"|c",
            MetricType::Gauge => b"|g",
        }
    }
}

/// Value of a metric object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    FloatingPoint(f64),
}

impl MetricValue {
    /// Creates a value from a float, preferring the integer form when the float is whole.
    pub fn from_f64(value: f64) -> Self {
        if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
            MetricValue::Integer(value as i64)
        } else {
            MetricValue::FloatingPoint(value)
        }
    }

    /// Returns the value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Integer(v) => v as f64,
            MetricValue::FloatingPoint(v) => v,
        }
    }
}

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format(&mut self, value: MetricValue) -> &str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(v),
            MetricValue::FloatingPoint(v) => self.float_writer.format(v),
        }
    }
}

/// A single statsd metric object: a fully-qualified key, a value, and a type.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsdMetric {
    key: String,
    value: MetricValue,
    metric_type: MetricType,
}

impl StatsdMetric {
    /// Creates a timing metric, in milliseconds.
    pub fn timing<K: Into<String>>(key: K, millis: f64) -> Self {
        StatsdMetric { key: key.into(), value: MetricValue::from_f64(millis), metric_type: MetricType::Timing }
    }

    /// Creates a counter metric that increments by one.
    pub fn increment<K: Into<String>>(key: K) -> Self {
        StatsdMetric { key: key.into(), value: MetricValue::Integer(1), metric_type: MetricType::Counter }
    }

    /// Creates a counter metric that increments by `count`.
    pub fn count<K: Into<String>>(key: K, count: u64) -> Self {
        let value = i64::try_from(count).map_or(MetricValue::FloatingPoint(count as f64), MetricValue::Integer);
        StatsdMetric { key: key.into(), value, metric_type: MetricType::Counter }
    }

    /// Creates a gauge metric.
    pub fn gauge<K: Into<String>>(key: K, value: f64) -> Self {
        StatsdMetric { key: key.into(), value: MetricValue::from_f64(value), metric_type: MetricType::Gauge }
    }

    /// Returns the fully-qualified key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value.
    pub fn value(&self) -> MetricValue {
        self.value
    }

    /// Returns the metric type.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    fn write_line(&self, formatter: &mut MetricValueFormatter, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.key.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(formatter.format(self.value).as_bytes());
        buf.extend_from_slice(self.metric_type.as_bytes());
    }
}

impl fmt::Display for StatsdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = Vec::new();
        self.write_line(&mut MetricValueFormatter::new(), &mut line);
        f.write_str(&String::from_utf8_lossy(&line))
    }
}

/// Packs metric lines into newline-delimited datagrams.
///
/// Each payload holds one or more complete metric lines and never exceeds the maximum payload length. A metric whose
/// line cannot fit in an empty payload is dropped.
pub(crate) struct PayloadWriter {
    max_payload_len: usize,
    payloads_buf: Vec<u8>,
    offsets: Vec<usize>,
    line_buf: Vec<u8>,
    formatter: MetricValueFormatter,
}

impl PayloadWriter {
    /// Creates a new `PayloadWriter` with the given maximum payload length.
    pub fn new(max_payload_len: usize) -> Self {
        // NOTE: configuration already rejects smaller lengths; this is the last line before producing empty payloads.
        assert!(
            max_payload_len >= SMALLEST_VALID_PAYLOAD.len(),
            "maximum payload length is too small to allow any metrics to be written (must be {} or greater)",
            SMALLEST_VALID_PAYLOAD.len()
        );

        Self {
            max_payload_len,
            payloads_buf: Vec::new(),
            offsets: Vec::new(),
            line_buf: Vec::new(),
            formatter: MetricValueFormatter::new(),
        }
    }

    fn last_offset(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    fn current_payload_len(&self) -> usize {
        self.payloads_buf.len() - self.last_offset()
    }

    fn finalize_current_payload(&mut self) {
        if self.current_payload_len() == 0 {
            return;
        }

        self.offsets.push(self.payloads_buf.len());
    }

    /// Writes a metric, returning `false` if it was too large to send at all.
    pub fn write(&mut self, metric: &StatsdMetric) -> bool {
        self.line_buf.clear();
        metric.write_line(&mut self.formatter, &mut self.line_buf);

        if self.line_buf.len() > self.max_payload_len {
            return false;
        }

        // Lines after the first in a payload need a separating newline.
        let current_payload_len = self.current_payload_len();
        let separator_len = usize::from(current_payload_len > 0);
        if current_payload_len + separator_len + self.line_buf.len() > self.max_payload_len {
            self.finalize_current_payload();
        }

        if self.current_payload_len() > 0 {
            self.payloads_buf.push(b'\n');
        }
        self.payloads_buf.extend_from_slice(&self.line_buf);

        true
    }

    /// Finalizes the current payload and drains every payload written so far.
    pub fn drain_payloads(&mut self) -> Vec<Vec<u8>> {
        self.finalize_current_payload();

        let buf = mem::take(&mut self.payloads_buf);
        let mut start = 0;
        let payloads = self
            .offsets
            .drain(..)
            .map(|end| {
                let payload = buf[start..end].to_vec();
                start = end;
                payload
            })
            .collect();

        // Keep the allocation for the next flush.
        self.payloads_buf = buf;
        self.payloads_buf.clear();

        payloads
    }
}
