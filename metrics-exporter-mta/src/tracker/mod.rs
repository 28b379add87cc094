//! Beacon tracker.
//!
//! The tracker is the receiving end of a [`BeaconPayload`](crate::BeaconPayload): it executes the queued commands,
//! collects data from producers, and batches everything queued within a short debounce window into a single beacon
//! request, a "combo send".
//!
//! Sampling happens here rather than on the server: each tracker draws a visitor code once, and a visitor is either
//! sampled for every beacon or for none.

use std::{collections::HashMap, mem, time::Duration};

use indexmap::IndexMap;
use quanta::{Clock, Instant};
use rand::Rng as _;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    buffer::MetricKind,
    config::DEFAULT_BEACON,
    dispatch::{Command, CommandError},
    measurement::Measurement,
};

mod beacon;
pub use self::beacon::{BeaconTransport, MAX_QUERY_LEN};
use self::beacon::{beacon_url, build_query};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

// Visitor codes are drawn from the positive 31-bit range.
const MAX_VISITOR_CODE: u32 = 2_147_483_647;

/// Data source polled when a category is sent.
///
/// A producer registered under a category replaces the data passed to `send` for that category. Producers that have
/// nothing to report return `None`, and the category contributes nothing to the beacon.
pub trait Producer: Send {
    /// Returns the metric kind of the produced data.
    fn kind(&self) -> MetricKind {
        MetricKind::Timer
    }

    /// Returns the current data, if any.
    fn produce(&mut self) -> Option<Measurement>;
}

impl<F> Producer for F
where
    F: FnMut() -> Option<Measurement> + Send,
{
    fn produce(&mut self) -> Option<Measurement> {
        self()
    }
}

/// Tracker configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    sample_rate: u8,
    use_combo: bool,
    beacon: String,
    debounce: Duration,
}

impl TrackerConfig {
    /// Sets the percentage of visitors that are sampled.
    ///
    /// Values above 100 are treated as 100.
    ///
    /// Defaults to 100.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u8) -> Self {
        self.sample_rate = sample_rate.min(100);
        self
    }

    /// Sets whether queued events are batched into a single beacon.
    ///
    /// When disabled, every queued event is sent as its own beacon.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_combo(mut self, use_combo: bool) -> Self {
        self.use_combo = use_combo;
        self
    }

    /// Sets the beacon image URL.
    ///
    /// Defaults to `/_.gif`.
    #[must_use]
    pub fn with_beacon<U: Into<String>>(mut self, beacon: U) -> Self {
        self.beacon = beacon.into();
        self
    }

    /// Sets how long the tracker waits for more data before sending.
    ///
    /// Every newly queued event restarts the wait.
    ///
    /// Defaults to 200 milliseconds.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Returns the sample rate, as a percentage.
    pub fn sample_rate(&self) -> u8 {
        self.sample_rate
    }

    /// Returns `true` if queued events are batched.
    pub fn use_combo(&self) -> bool {
        self.use_combo
    }

    /// Returns the beacon image URL.
    pub fn beacon(&self) -> &str {
        &self.beacon
    }

    /// Returns the debounce window.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            sample_rate: 100,
            use_combo: true,
            beacon: DEFAULT_BEACON.to_owned(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// An event waiting to be sent.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueuedEvent {
    category: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    data: Measurement,
}

impl QueuedEvent {
    /// Returns the data category.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Returns the data.
    pub fn data(&self) -> &Measurement {
        &self.data
    }
}

/// Batches metric events into beacon requests.
///
/// The tracker does nothing until an application is set with `create`. Events queued with `send`, or one of its
/// shorthands, are held until the debounce window passes without new events, and are then sent together. Callers
/// drive the window by calling [`Tracker::poll`], or send immediately with [`Tracker::flush`].
pub struct Tracker<T> {
    config: TrackerConfig,
    transport: T,
    clock: Clock,
    app: Option<String>,
    tags: IndexMap<String, String>,
    client_info: Vec<(String, String)>,
    visitor_code: u32,
    producers: HashMap<String, Box<dyn Producer>>,
    queue: Vec<QueuedEvent>,
    deadline: Option<Instant>,
}

impl<T: BeaconTransport> Tracker<T> {
    /// Creates a new `Tracker` that fires beacons through `transport`.
    ///
    /// The visitor code is drawn at random.
    pub fn new(config: TrackerConfig, transport: T) -> Self {
        Tracker {
            config,
            transport,
            clock: Clock::new(),
            app: None,
            tags: IndexMap::new(),
            client_info: Vec::new(),
            visitor_code: rand::rng().random_range(0..=MAX_VISITOR_CODE),
            producers: HashMap::new(),
            queue: Vec::new(),
            deadline: None,
        }
    }

    /// Sets the clock used for the debounce window.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the visitor code used for sampling.
    #[must_use]
    pub fn with_visitor_code(mut self, visitor_code: u32) -> Self {
        self.visitor_code = visitor_code;
        self
    }

    /// Sets client information, such as screen size, sent with every beacon.
    #[must_use]
    pub fn with_client_info<I, K, V>(mut self, info: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.client_info = info.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Registers a producer for `category`, replacing any existing one.
    pub fn add_producer<P>(&mut self, category: &str, producer: P)
    where
        P: Producer + 'static,
    {
        self.producers.insert(category.to_owned(), Box::new(producer));
    }

    /// Returns the application name, if set.
    pub fn app(&self) -> Option<&str> {
        self.app.as_deref()
    }

    /// Returns the current settings.
    pub fn settings(&self) -> &TrackerConfig {
        &self.config
    }

    /// Returns the queued events.
    pub fn queue(&self) -> &[QueuedEvent] {
        &self.queue
    }

    /// Returns a reference to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Executes raw commands, each a JSON argument array.
    ///
    /// Returns the number of commands that could not be executed.
    pub fn push<I, A>(&mut self, commands: I) -> usize
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[Value]>,
    {
        let mut failed = 0;
        for args in commands {
            if let Err(e) = self.push_args(args.as_ref()) {
                debug!(error = %e, "Skipping tracker command.");
                failed += 1;
            }
        }
        failed
    }

    /// Executes a single raw command.
    ///
    /// # Errors
    ///
    /// If the command cannot be parsed, an error is returned and nothing is executed.
    pub fn push_args(&mut self, args: &[Value]) -> Result<(), CommandError> {
        let command = Command::from_args(args)?;
        self.apply(command);
        Ok(())
    }

    /// Executes a command.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Create { app, settings } => {
                self.create(&app);
                if let Some(settings) = settings {
                    self.merge_settings(&settings);
                }
            }
            Command::Config { key, value } => self.config(&key, &value),
            Command::Tag { key, value } => self.tag(&key, value),
            Command::Send { category, data, kind } => self.send(&category, data, kind),
        }
    }

    /// Sets the application that beacons are reported for.
    pub fn create(&mut self, app: &str) {
        self.app = Some(app.to_owned());
    }

    /// Merges a settings object over the current settings.
    ///
    /// Recognized keys are `sampleRate`, `useCombo` and `beacon`. Invalid values and other keys are ignored.
    pub fn merge_settings(&mut self, settings: &Map<String, Value>) {
        for (key, value) in settings {
            match key.as_str() {
                "sampleRate" => self.config(key, value),
                "beacon" => self.config("beaconImage", value),
                "useCombo" => match value.as_bool() {
                    Some(use_combo) => self.config.use_combo = use_combo,
                    None => debug!(%value, "Ignoring invalid combo setting."),
                },
                _ => {}
            }
        }
    }

    /// Changes a tracker setting.
    ///
    /// `sampleRate` takes a number between 0 and 100, and `beaconImage` a non-empty URL. Other keys, and values of
    /// the wrong type, are ignored.
    pub fn config(&mut self, key: &str, value: &Value) {
        match key {
            "sampleRate" => match value.as_f64() {
                Some(rate) if (0.0..=100.0).contains(&rate) => self.config.sample_rate = rate as u8,
                _ => debug!(%value, "Ignoring invalid tracker sample rate."),
            },
            "beaconImage" => match value.as_str() {
                Some(beacon) if !beacon.is_empty() => self.config.beacon = beacon.to_owned(),
                _ => debug!(%value, "Ignoring invalid beacon image."),
            },
            _ => {}
        }
    }

    /// Sets a tag sent with every beacon, or removes it when `value` is `None`.
    pub fn tag(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.tags.insert(key.to_owned(), value);
            }
            None => {
                self.tags.shift_remove(key);
            }
        }
    }

    /// Queues data for the next beacon.
    ///
    /// If a producer is registered for `category`, its data is queued instead of `data`. The kind defaults to timer.
    /// Queuing anything restarts the debounce window.
    pub fn send(&mut self, category: &str, data: Option<Measurement>, kind: Option<MetricKind>) {
        if category.is_empty() {
            return;
        }

        let event = match self.producers.get_mut(category) {
            Some(producer) => producer.produce().map(|data| (data, producer.kind())),
            None => data.map(|data| (data, kind.unwrap_or(MetricKind::Timer))),
        };

        if let Some((data, kind)) = event {
            self.queue.push(QueuedEvent { category: category.to_owned(), kind, data });
            self.deadline = Some(self.clock.now() + self.config.debounce);
        }
    }

    /// Queues timing data, in milliseconds.
    pub fn timing<M: Into<Measurement>>(&mut self, category: &str, data: M) {
        self.send(category, Some(data.into()), Some(MetricKind::Timer));
    }

    /// Queues counter data.
    pub fn count<M: Into<Measurement>>(&mut self, category: &str, data: M) {
        self.send(category, Some(data.into()), Some(MetricKind::Counter));
    }

    /// Queues gauge data.
    pub fn gauge<M: Into<Measurement>>(&mut self, category: &str, data: M) {
        self.send(category, Some(data.into()), Some(MetricKind::Gauge));
    }

    /// Sends the queued events if the debounce window has passed.
    ///
    /// Returns the number of beacons fired.
    pub fn poll(&mut self) -> usize {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => self.flush(),
            _ => 0,
        }
    }

    /// Sends the queued events now.
    ///
    /// Nothing is sent until an application has been set. If this visitor is not sampled, the queued events are
    /// discarded. Returns the number of beacons fired.
    pub fn flush(&mut self) -> usize {
        self.deadline = None;

        let Some(app) = self.app.clone() else {
            return 0;
        };
        if self.queue.is_empty() {
            return 0;
        }

        let queue = mem::take(&mut self.queue);
        if !self.is_sampled() {
            debug!(visitor_code = self.visitor_code, sample_rate = self.config.sample_rate, "Visitor not sampled.");
            return 0;
        }

        let base = self.base_params(&app);
        let beacon = self.config.beacon.as_str();
        if !self.config.use_combo {
            let mut fired = 0;
            for event in &queue {
                if fire(&mut self.transport, beacon, merge_event(base.clone(), event)) {
                    fired += 1;
                }
            }
            return fired;
        }

        let params = match queue.as_slice() {
            [event] => merge_event(base, event),
            events => {
                let mut params = base;
                params.insert("data".to_owned(), serde_json::to_string(events).unwrap_or_default());
                params
            }
        };

        usize::from(fire(&mut self.transport, beacon, params))
    }

    fn is_sampled(&self) -> bool {
        self.visitor_code % 10_000 < u32::from(self.config.sample_rate) * 100
    }

    fn base_params(&self, app: &str) -> IndexMap<String, String> {
        let mut params = IndexMap::new();
        params.insert("app".to_owned(), app.to_owned());
        params.insert("type".to_owned(), "combo".to_owned());
        for (key, value) in self.tags.iter().chain(self.client_info.iter().map(|(k, v)| (k, v))) {
            params.insert(key.clone(), value.clone());
        }
        params
    }
}

fn fire<T: BeaconTransport>(transport: &mut T, beacon: &str, params: IndexMap<String, String>) -> bool {
    let params: Vec<(String, String)> = params.into_iter().collect();
    let Some(query) = build_query(&params) else {
        return false;
    };

    match transport.fire(&beacon_url(beacon, &query)) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to fire beacon.");
            false
        }
    }
}

// Later keys win, as when merging objects.
fn merge_event(mut params: IndexMap<String, String>, event: &QueuedEvent) -> IndexMap<String, String> {
    params.insert("category".to_owned(), event.category.clone());
    params.insert("type".to_owned(), event.kind.as_str().to_owned());
    params.insert("data".to_owned(), serde_json::to_string(&event.data).unwrap_or_default());
    params
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use quanta::Clock;
    use serde_json::{json, Value};

    use super::{BeaconTransport, Tracker, TrackerConfig, MAX_QUERY_LEN};
    use crate::{buffer::MetricKind, measurement::Measurement};

    #[derive(Default)]
    struct Beacons(Vec<String>);

    impl BeaconTransport for Beacons {
        fn fire(&mut self, url: &str) -> io::Result<()> {
            self.0.push(url.to_owned());
            Ok(())
        }
    }

    fn query(url: &str) -> Vec<(String, String)> {
        let (_, query) = url.split_once('?').unwrap();
        serde_urlencoded::from_str(query).unwrap()
    }

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn nothing_is_sent_without_an_app() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        tracker.timing("api", 25);

        assert_eq!(tracker.flush(), 0);
        assert_eq!(tracker.queue().len(), 1);
        assert!(tracker.transport().0.is_empty());
    }

    #[test]
    fn single_event_is_merged_into_payload() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default())
            .with_visitor_code(0)
            .with_client_info([("sr", "1280x720")]);
        tracker.create("www");
        tracker.tag("server", Some("web01".to_owned()));
        tracker.timing("api", Measurement::group([("deal", 25)]));

        assert_eq!(tracker.flush(), 1);
        assert_eq!(
            tracker.transport().0,
            ["/_.gif?app=www&type=timer&server=web01&sr=1280x720&category=api&data=%7B%22deal%22%3A25%7D"]
        );
        assert!(tracker.queue().is_empty());
    }

    #[test]
    fn several_events_are_combined() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        tracker.create("www");
        tracker.timing("api", 25);
        tracker.count("clicks", Measurement::group([("buy", 2)]));

        assert_eq!(tracker.flush(), 1);
        let params = query(&tracker.transport().0[0]);
        assert_eq!(param(&params, "type"), Some("combo"));

        let data: Value = serde_json::from_str(param(&params, "data").unwrap()).unwrap();
        assert_eq!(
            data,
            json!([
                {"category": "api", "type": "timer", "data": 25},
                {"category": "clicks", "type": "counter", "data": {"buy": 2}},
            ])
        );
    }

    #[test]
    fn without_combo_each_event_is_sent() {
        let config = TrackerConfig::default().with_combo(false);
        let mut tracker = Tracker::new(config, Beacons::default()).with_visitor_code(0);
        tracker.create("www");
        tracker.timing("api", 25);
        tracker.gauge("memory", 64);

        assert_eq!(tracker.flush(), 2);
        let second = query(&tracker.transport().0[1]);
        assert_eq!(param(&second, "app"), Some("www"));
        assert_eq!(param(&second, "category"), Some("memory"));
        assert_eq!(param(&second, "type"), Some("gauge"));
    }

    #[test]
    fn debounce_restarts_on_new_data() {
        let (clock, mock) = Clock::mock();
        let mut tracker =
            Tracker::new(TrackerConfig::default(), Beacons::default()).with_clock(clock).with_visitor_code(0);
        tracker.create("www");
        assert_eq!(tracker.poll(), 0);

        tracker.timing("api", 25);
        mock.increment(Duration::from_millis(150));
        assert_eq!(tracker.poll(), 0);

        tracker.timing("render", 40);
        mock.increment(Duration::from_millis(150));
        assert_eq!(tracker.poll(), 0);

        mock.increment(Duration::from_millis(50));
        assert_eq!(tracker.poll(), 1);
        assert_eq!(tracker.poll(), 0);
    }

    #[test]
    fn visitor_sampling() {
        let config = TrackerConfig::default().with_sample_rate(50);

        let mut sampled = Tracker::new(config.clone(), Beacons::default()).with_visitor_code(14_999);
        sampled.create("www");
        sampled.timing("api", 25);
        assert_eq!(sampled.flush(), 1);

        let mut skipped = Tracker::new(config, Beacons::default()).with_visitor_code(15_000);
        skipped.create("www");
        skipped.timing("api", 25);
        assert_eq!(skipped.flush(), 0);
        assert!(skipped.queue().is_empty());
        assert!(skipped.transport().0.is_empty());
    }

    #[test]
    fn producers_replace_sent_data() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        tracker.add_producer("page", || Some(Measurement::group([("load", 820), ("domready", 310)])));
        tracker.add_producer("cdn", || -> Option<Measurement> { None });

        tracker.send("page", Some(Measurement::from(1)), Some(MetricKind::Gauge));
        tracker.send("cdn", None, None);
        tracker.send("network", None, None);
        tracker.send("", Some(Measurement::from(1)), None);

        assert_eq!(tracker.queue().len(), 1);
        let event = &tracker.queue()[0];
        assert_eq!(event.category(), "page");
        assert_eq!(event.kind(), MetricKind::Timer);
        assert_eq!(event.data(), &Measurement::group([("domready", 310), ("load", 820)]));
    }

    #[test]
    fn push_replays_raw_commands() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        let failed = tracker.push([
            vec![json!("create"), json!("www")],
            vec![json!("config"), json!("beaconImage"), json!("http://127.0.0.1:8888/_.gif")],
            vec![json!("config"), json!("sampleRate"), json!(150)],
            vec![json!("tag"), json!("server"), json!("web01")],
            vec![json!("tag"), json!("server")],
            vec![json!("send"), json!("server"), json!({"req": 10}), json!("timer")],
            vec![json!("explode")],
            vec![],
        ]);

        assert_eq!(failed, 2);
        assert_eq!(tracker.app(), Some("www"));
        assert_eq!(tracker.settings().sample_rate(), 100);

        assert_eq!(tracker.flush(), 1);
        let url = &tracker.transport().0[0];
        assert!(url.starts_with("http://127.0.0.1:8888/_.gif?"));
        assert_eq!(param(&query(url), "server"), None);
    }

    #[test]
    fn create_merges_settings() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        let failed = tracker.push([vec![
            json!("create"),
            json!("www"),
            json!({"useCombo": false, "sampleRate": 20, "beacon": "http://127.0.0.1:8888/_.gif", "debug": true}),
        ]]);

        assert_eq!(failed, 0);
        assert_eq!(tracker.app(), Some("www"));
        assert!(!tracker.settings().use_combo());
        assert_eq!(tracker.settings().sample_rate(), 20);
        assert_eq!(tracker.settings().beacon(), "http://127.0.0.1:8888/_.gif");

        tracker.push([vec![json!("create"), json!("m"), json!({"useCombo": "yes", "sampleRate": 500})]]);
        assert_eq!(tracker.app(), Some("m"));
        assert!(!tracker.settings().use_combo());
        assert_eq!(tracker.settings().sample_rate(), 20);

        tracker.timing("api", 25);
        tracker.gauge("memory", 64);
        assert_eq!(tracker.flush(), 2);
    }

    #[test]
    fn oversized_beacon_reports_length() {
        let mut tracker = Tracker::new(TrackerConfig::default(), Beacons::default()).with_visitor_code(0);
        tracker.create("www");
        let big = Measurement::group((0..MAX_QUERY_LEN).map(|i| (format!("metric{i}"), i)));
        tracker.timing("api", big);

        assert_eq!(tracker.flush(), 1);
        let params = query(&tracker.transport().0[0]);
        assert_eq!(param(&params, "err"), Some("len"));
        assert_eq!(param(&params, "max"), Some("2036"));
    }
}
