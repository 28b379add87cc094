use std::sync::Arc;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use thiserror::Error;

use crate::{client::Client, key::sanitize_tag_value};

/// Errors that could occur while installing the recorder.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install recorder as global recorder")]
    FailedToInstall,
}

/// A recorder that buffers metrics in an account client.
///
/// This lets code instrumented with the [`metrics`] macros report through an account:
///
/// - counters are buffered as counters, and absolute counter values replace the buffered count
/// - gauges are buffered as gauges
/// - histogram values are buffered as timings, so they should be recorded in milliseconds
///
/// Labels are folded into the local name as `<name>.<label key>.<label value>`, with label values sanitized like tag
/// values. Nothing is sent until the account is flushed.
pub struct MtaRecorder {
    client: Client,
}

impl MtaRecorder {
    /// Creates a new `MtaRecorder` that buffers into `client`.
    pub fn new(client: Client) -> Self {
        MtaRecorder { client }
    }

    /// Returns the account client metrics are buffered into.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Installs the recorder as the global recorder.
    ///
    /// # Errors
    ///
    /// If a global recorder is already installed, an error is returned.
    pub fn install(self) -> Result<(), InstallError> {
        metrics::set_global_recorder(self).map_err(|_| InstallError::FailedToInstall)
    }

    fn handle(&self, key: &Key) -> Arc<Handle> {
        Arc::new(Handle { client: self.client.clone(), name: local_name(key) })
    }
}

impl Recorder for MtaRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

struct Handle {
    client: Client,
    name: String,
}

impl CounterFn for Handle {
    fn increment(&self, value: u64) {
        self.client.update_buffer(|buffer| buffer.increment_by(&self.name, value));
    }

    fn absolute(&self, value: u64) {
        self.client.update_buffer(|buffer| buffer.set_counter(&self.name, value));
    }
}

impl GaugeFn for Handle {
    fn increment(&self, value: f64) {
        self.client.update_buffer(|buffer| buffer.adjust_gauge(&self.name, value));
    }

    fn decrement(&self, value: f64) {
        self.client.update_buffer(|buffer| buffer.adjust_gauge(&self.name, -value));
    }

    fn set(&self, value: f64) {
        self.client.update_buffer(|buffer| buffer.gauge(&self.name, value));
    }
}

impl HistogramFn for Handle {
    fn record(&self, value: f64) {
        self.client.update_buffer(|buffer| buffer.add_timing(&self.name, value));
    }
}

fn local_name(key: &Key) -> String {
    let mut name = key.name().to_owned();
    for label in key.labels() {
        name.push('.');
        name.push_str(label.key());
        name.push('.');
        name.push_str(&sanitize_tag_value(label.value()));
    }
    name
}

#[cfg(test)]
mod tests {
    use metrics::{counter, gauge, histogram, Key, Label};

    use super::{local_name, MtaRecorder};
    use crate::registry::AccountRegistry;

    #[test]
    fn labels_fold_into_name() {
        let key = Key::from_parts("requests", vec![Label::new("route", "/deals/today"), Label::new("code", "200")]);
        assert_eq!(local_name(&key), "requests.route.-deals-today.code.200");
        assert_eq!(local_name(&Key::from_name("hits")), "hits");
    }

    #[test]
    fn macros_buffer_into_account() {
        let registry = AccountRegistry::new();
        let client = registry.client("www");
        let recorder = MtaRecorder::new(client.clone());

        metrics::with_local_recorder(&recorder, || {
            counter!("hits").increment(2);
            counter!("hits").increment(1);
            gauge!("inflight").increment(3.0);
            gauge!("inflight").decrement(1.0);
            gauge!("total").set(300.0);
            histogram!("render", "phase" => "body").record(12.0);
        });

        let buffer = client.buffer();
        assert_eq!(buffer.counters().get("hits"), Some(&3));
        assert_eq!(buffer.gauges().get("inflight"), Some(&2.0));
        assert_eq!(buffer.gauges().get("total"), Some(&300.0));
        assert_eq!(buffer.timers().get("render.phase.body"), Some(&12.0));
    }
}
