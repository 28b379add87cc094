use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use quanta::Clock;
use serde_json::Value;
use tracing::{debug, error, trace};

use crate::{
    buffer::MetricBuffer,
    config::{ConfigError, Configuration, SenderKind},
    dispatch::{build_beacon, build_metrics, FlushOutcome, InitBlock},
    key::{KeyBuilder, Tags},
    measurement::Measurement,
    sampler::should_send,
    sender::{MetricSender, SenderFactory},
    timer::TimerRegistry,
};

struct ClientState {
    config: Configuration,
    tags: Tags,
    timers: TimerRegistry,
    buffer: MetricBuffer,
    header_sent: bool,
    sender: Option<Box<dyn MetricSender>>,
}

impl ClientState {
    fn take_header(&mut self) -> Option<InitBlock> {
        if self.config.sender() != SenderKind::Browser || self.header_sent {
            return None;
        }

        self.header_sent = true;
        Some(InitBlock::new())
    }

    fn clear(&mut self) {
        self.timers.clear();
        self.buffer.clear();
    }

    fn flush(
        &mut self, account: &str, merged_timers: BTreeMap<String, u64>, sender_factory: &dyn SenderFactory,
    ) -> FlushOutcome {
        for (name, millis) in merged_timers.into_iter().chain(self.timers.snapshot()) {
            self.buffer.add_timing(&name, millis);
        }

        if !self.config.sender().is_server_side() {
            let header = self.take_header();
            let payload = build_beacon(account, &self.config, &self.tags, &self.buffer, header);
            self.clear();
            trace!(account, commands = payload.commands().len(), "Built beacon payload.");
            return FlushOutcome::Beacon(payload);
        }

        if self.buffer.is_empty() {
            self.clear();
            return FlushOutcome::Empty;
        }

        let sample_rate = self.config.sample_rate();
        if !should_send(sample_rate, &mut rand::rng()) {
            self.clear();
            debug!(account, sample_rate, "Flush cycle not sampled; discarding buffered metrics.");
            return FlushOutcome::Sampled;
        }

        // Tags are fixed for the whole cycle: the state lock is held until the buffer has been cleared.
        let keys = KeyBuilder::new(account, self.config.tag_prefix(), &self.tags);
        let metrics = build_metrics(&self.buffer, &keys);
        self.clear();

        let mut sender = match self.sender.take() {
            Some(sender) => sender,
            None => match sender_factory.build(&self.config) {
                Ok(sender) => sender,
                Err(e) => {
                    error!(account, sender = %self.config.sender(), error = %e, "Failed to create metric sender.");
                    return FlushOutcome::Dropped { metrics: metrics.len() };
                }
            },
        };

        let result = sender.send(&metrics);
        self.sender = Some(sender);

        match result {
            Ok(bytes) => {
                debug!(account, metrics = metrics.len(), bytes, "Flushed metrics.");
                FlushOutcome::Sent { metrics: metrics.len(), bytes }
            }
            Err(e) => {
                error!(account, metrics = metrics.len(), error = %e, "Failed to send metrics.");
                FlushOutcome::Dropped { metrics: metrics.len() }
            }
        }
    }
}

struct ClientInner {
    account: String,
    state: Mutex<ClientState>,
    anonymous: Option<Client>,
    sender_factory: Arc<dyn SenderFactory>,
}

/// Handle to a single account's metrics.
///
/// Handles are cheap to clone, and every clone refers to the same account state. All methods take `&self` and are
/// safe to call from multiple threads.
///
/// Names passed to the recording methods are local to the account: on flush, they are qualified with the account name
/// and the account's tags. Calls with an empty name are ignored.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn new(
        account: String, config: Configuration, clock: Clock, anonymous: Option<Client>,
        sender_factory: Arc<dyn SenderFactory>,
    ) -> Self {
        let state = ClientState {
            config,
            tags: Tags::new(),
            timers: TimerRegistry::new(clock),
            buffer: MetricBuffer::new(),
            header_sent: false,
            sender: None,
        };

        Client { inner: Arc::new(ClientInner { account, state: Mutex::new(state), anonymous, sender_factory }) }
    }

    /// Returns the account name.
    pub fn account(&self) -> &str {
        &self.inner.account
    }

    /// Returns `true` if both handles refer to the same account client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Updates a single configuration key.
    ///
    /// See [`Configuration::set`] for the supported keys. Changing a transport-related key discards the cached
    /// metric sender, so the next flush builds a new one.
    ///
    /// # Errors
    ///
    /// If the key is unknown or the value is invalid, an error is returned and the configuration is left unchanged.
    pub fn config<V: Into<Value>>(&self, key: &str, value: V) -> Result<(), ConfigError> {
        let mut state = self.inner.state.lock();
        state.config.set(key, value.into())?;
        if Configuration::affects_sender(key) {
            state.sender = None;
        }
        Ok(())
    }

    /// Replaces the whole configuration.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned and the current configuration is kept.
    pub fn configure(&self, config: Configuration) -> Result<(), ConfigError> {
        config.validate()?;

        let mut state = self.inner.state.lock();
        state.config = config;
        state.sender = None;
        Ok(())
    }

    /// Returns a copy of the current configuration.
    pub fn configuration(&self) -> Configuration {
        self.inner.state.lock().config.clone()
    }

    /// Sets a tag that is appended to every key of this account.
    ///
    /// The value is sanitized so that it stays a single key segment.
    pub fn tag(&self, name: &str, value: &str) {
        if name.is_empty() {
            return;
        }

        self.inner.state.lock().tags.insert(name, value);
    }

    /// Removes a tag.
    pub fn remove_tag(&self, name: &str) {
        self.inner.state.lock().tags.remove(name);
    }

    /// Returns a copy of the current tags.
    pub fn tags(&self) -> Tags {
        self.inner.state.lock().tags.clone()
    }

    /// Starts the named timer.
    pub fn start(&self, name: &str) {
        self.inner.state.lock().timers.start(name);
    }

    /// Stops the named timer, adding the elapsed time to its record.
    pub fn stop(&self, name: &str) {
        self.inner.state.lock().timers.stop(name);
    }

    /// Adds an externally measured duration to the named timer record.
    pub fn record(&self, name: &str, elapsed: Duration) {
        self.inner.state.lock().timers.record(name, elapsed);
    }

    /// Buffers a timing value, in milliseconds.
    ///
    /// Breakdowns are flattened into dotted names.
    pub fn timing<M: Into<Measurement>>(&self, name: &str, value: M) {
        self.inner.state.lock().buffer.add_timing(name, value);
    }

    /// Increments a counter by one.
    pub fn increment(&self, name: &str) {
        self.inner.state.lock().buffer.increment(name);
    }

    /// Increments each named counter by one.
    pub fn increment_all<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.state.lock().buffer.increment_all(names);
    }

    /// Increments a counter by `value`.
    pub fn increment_by(&self, name: &str, value: u64) {
        self.inner.state.lock().buffer.increment_by(name, value);
    }

    /// Sets a gauge.
    pub fn gauge(&self, name: &str, value: f64) {
        self.inner.state.lock().buffer.gauge(name, value);
    }

    /// Drops all buffered metrics, timer records and running timers.
    pub fn clear(&self) {
        self.inner.state.lock().clear();
    }

    /// Returns the named timer record, rounded up to whole milliseconds.
    pub fn timer(&self, name: &str) -> Option<u64> {
        self.inner.state.lock().timers.get(name)
    }

    /// Returns every timer record, rounded up to whole milliseconds.
    pub fn timers(&self) -> BTreeMap<String, u64> {
        self.inner.state.lock().timers.snapshot()
    }

    /// Returns a copy of the buffered metrics.
    pub fn buffer(&self) -> MetricBuffer {
        self.inner.state.lock().buffer.clone()
    }

    /// Returns the page bootstrap for the beacon tracker.
    ///
    /// The bootstrap is returned at most once per client, and only for browser accounts. If it is taken here, the next
    /// flush does not include it.
    pub fn header(&self) -> Option<InitBlock> {
        self.inner.state.lock().take_header()
    }

    /// Flushes the account.
    ///
    /// Timer records of the registry's anonymous account are merged in first, followed by this account's own timer
    /// records. Browser accounts then return their commands as a [`FlushOutcome::Beacon`]. Server-side accounts draw
    /// against the sample rate and, on a hit, hand their metrics to the metric sender.
    ///
    /// All buffered metrics, timer records and running timers are cleared, whatever the outcome.
    pub fn send(&self) -> FlushOutcome {
        let merged_timers = match &self.inner.anonymous {
            Some(anonymous) => anonymous.drain_timers(),
            None => BTreeMap::new(),
        };

        let mut state = self.inner.state.lock();
        state.flush(&self.inner.account, merged_timers, &*self.inner.sender_factory)
    }

    /// Flushes the account.
    ///
    /// Alias of [`Client::send`].
    pub fn flush(&self) -> FlushOutcome {
        self.send()
    }

    pub(crate) fn update_buffer<F>(&self, f: F)
    where
        F: FnOnce(&mut MetricBuffer),
    {
        f(&mut self.inner.state.lock().buffer);
    }

    // The anonymous account hands its timer records to whichever account flushes, and is cleared.
    fn drain_timers(&self) -> BTreeMap<String, u64> {
        let mut state = self.inner.state.lock();
        let timers = state.timers.snapshot();
        state.clear();
        timers
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("account", &self.inner.account).finish_non_exhaustive()
    }
}
