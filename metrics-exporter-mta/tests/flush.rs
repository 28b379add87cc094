use std::{io, sync::Arc, time::Duration};

use metrics_exporter_mta::{
    AccountRegistry, Configuration, FlushOutcome, Measurement, MetricSender, MetricType, MetricValue, StatsdMetric,
};
use parking_lot::Mutex;
use quanta::{Clock, Mock};
use serde_json::{json, Value};

/// Every batch handed to a metric sender, across all senders built by the registry.
#[derive(Clone, Default)]
struct Transport {
    batches: Arc<Mutex<Vec<Vec<StatsdMetric>>>>,
    fail: bool,
}

impl Transport {
    fn failing() -> Self {
        Transport { fail: true, ..Default::default() }
    }

    fn calls(&self) -> usize {
        self.batches.lock().len()
    }

    fn last(&self) -> Vec<StatsdMetric> {
        self.batches.lock().last().cloned().unwrap_or_default()
    }
}

struct RecordingSender(Transport);

impl MetricSender for RecordingSender {
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize> {
        self.0.batches.lock().push(metrics.to_vec());
        if self.0.fail {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "collector is down"))
        } else {
            Ok(metrics.iter().map(|m| m.to_string().len()).sum())
        }
    }
}

fn registry(transport: &Transport) -> (AccountRegistry, Arc<Mock>) {
    let transport = transport.clone();
    let (clock, mock) = Clock::mock();
    let registry = AccountRegistry::with_parts(clock, move |_: &Configuration| -> io::Result<Box<dyn MetricSender>> {
        Ok(Box::new(RecordingSender(transport.clone())))
    });
    (registry, mock)
}

fn echo(sample_rate: u8) -> [(&'static str, Value); 2] {
    [("sender", json!("echo")), ("sampleRate", json!(sample_rate))]
}

#[test]
fn elapsed_time_sums_over_cycles_and_rounds_up() {
    let transport = Transport::default();
    let (registry, mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    for micros in [2_300, 4_100, 1_000] {
        client.start("db");
        mock.increment(Duration::from_micros(micros));
        client.stop("db");
    }

    // 7.4ms in total.
    assert_eq!(client.timer("db"), Some(8));
}

#[test]
fn start_is_idempotent_and_stray_stop_is_ignored() {
    let transport = Transport::default();
    let (registry, mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.start("req");
    mock.increment(Duration::from_millis(4));
    client.start("req");
    mock.increment(Duration::from_millis(6));
    client.stop("req");
    client.stop("never-started");
    client.stop("");

    assert_eq!(client.timer("req"), Some(10));
    assert_eq!(client.timer("never-started"), None);
    assert_eq!(client.timers().len(), 1);
}

#[test]
fn increment_list_and_nested_timing() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.increment_all(["a", "a", "b"]);
    client.timing("api", Measurement::group([("deal", 25), ("dynamic", 10)]));

    let buffer = client.buffer();
    assert_eq!(buffer.counters().get("a"), Some(&2));
    assert_eq!(buffer.counters().get("b"), Some(&1));
    assert_eq!(buffer.timers().get("api.deal"), Some(&25.0));
    assert_eq!(buffer.timers().get("api.dynamic"), Some(&10.0));
    assert_eq!(buffer.timers().get("api"), None);
}

#[test]
fn zero_sample_rate_never_sends() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(0)).unwrap();

    for _ in 0..500 {
        client.increment("hits");
        assert_eq!(client.send(), FlushOutcome::Sampled);
        assert!(client.buffer().is_empty());
    }
    assert_eq!(transport.calls(), 0);
}

#[test]
fn full_sample_rate_sends_every_flush_once() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    for flush in 1..=50 {
        client.increment("hits");
        assert!(client.send().is_sent());
        assert_eq!(transport.calls(), flush);
        assert!(client.buffer().is_empty());
    }
}

#[test]
fn failed_send_still_clears() {
    let transport = Transport::failing();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.increment("hits");
    client.gauge("total", 1.0);
    assert_eq!(client.send(), FlushOutcome::Dropped { metrics: 2 });
    assert_eq!(transport.calls(), 1);
    assert!(client.buffer().is_empty());
}

#[test]
fn counter_expands_into_unit_increments() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.increment_by("hits", 4);
    client.send();

    let metrics = transport.last();
    assert_eq!(metrics.len(), 4);
    for metric in &metrics {
        assert_eq!(metric.key(), "www.hits");
        assert_eq!(metric.metric_type(), MetricType::Counter);
        assert_eq!(metric.value(), MetricValue::Integer(1));
    }
}

#[test]
fn large_counter_is_sent_as_one_object() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.increment_by("bytes_sent", 3_000_000);
    assert_eq!(client.send(), FlushOutcome::Sent { metrics: 1, bytes: "www.bytes_sent:3000000|c".len() });

    client.increment_by("bytes_sent", u64::MAX);
    client.increment_by("bytes_sent", 1);
    assert!(client.send().is_sent());
    assert_eq!(transport.last().len(), 1);
    assert_eq!(transport.last()[0].metric_type(), MetricType::Counter);
}

#[test]
fn lookup_returns_same_handle() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);

    let first = registry.get_or_create("www", echo(100)).unwrap();
    let second = registry.get_or_create("www", echo(0)).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(second.configuration().sample_rate(), 100);
}

#[test]
fn end_to_end() {
    let transport = Transport::default();
    let (registry, mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.start("req");
    mock.increment(Duration::from_millis(10));
    client.stop("req");
    client.increment("hits");
    client.gauge("total", 300.0);

    assert_eq!(client.send(), FlushOutcome::Sent { metrics: 3, bytes: 40 });

    let metrics = transport.last();
    assert_eq!(metrics.len(), 3);

    let timing = metrics.iter().find(|m| m.metric_type() == MetricType::Timing).unwrap();
    assert!(timing.key().contains("req"));
    assert_eq!(timing.value(), MetricValue::Integer(10));

    let hits = metrics.iter().find(|m| m.metric_type() == MetricType::Counter).unwrap();
    assert_eq!(hits.key(), "www.hits");

    let total = metrics.iter().find(|m| m.metric_type() == MetricType::Gauge).unwrap();
    assert_eq!(total.key(), "www.total");
    assert_eq!(total.value(), MetricValue::Integer(300));

    assert!(client.buffer().is_empty());
    assert!(client.timers().is_empty());
}

#[test]
fn tagged_keys_for_every_metric_of_a_cycle() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", echo(100)).unwrap();

    client.tag("server", "web01.example.com");
    client.tag("page", "/deals/today");
    client.timing("render", 12);
    client.gauge("total", 300.0);
    client.send();

    let lines: Vec<String> = transport.last().iter().map(ToString::to_string).collect();
    assert_eq!(
        lines,
        [
            "www.render._t_server.web01-example-com._t_page.-deals-today:12|ms",
            "www.total._t_server.web01-example-com._t_page.-deals-today:300|g",
        ]
    );
}

#[test]
fn browser_flush_queues_commands_without_sampling() {
    let transport = Transport::default();
    let (registry, _mock) = registry(&transport);
    let client = registry.get_or_create("www", [("sampleRate", 0)]).unwrap();

    client.timing("req", 10);
    let payload = client.send().into_beacon().unwrap();

    assert!(payload.header().is_some());
    assert_eq!(payload.account(), "www");
    assert!(payload.commands().iter().any(|c| c.to_args()
        == vec![json!("send"), json!("server"), json!({"req": 10}), json!("timer")]));
    assert_eq!(transport.calls(), 0);
    assert!(client.buffer().is_empty());
}
