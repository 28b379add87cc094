use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use quanta::{Clock, Instant};

/// Named stopwatches for a single account.
///
/// A timer is running between `start` and `stop`. Each completed start/stop cycle adds its elapsed time to the
/// record for that name, so timing the same section several times within a flush period yields the total time spent.
/// Records are kept in fractional milliseconds and only rounded, upwards, when read.
pub struct TimerRegistry {
    clock: Clock,
    running: HashMap<String, Instant>,
    records: BTreeMap<String, f64>,
}

impl TimerRegistry {
    /// Creates a new `TimerRegistry` that reads time from `clock`.
    pub fn new(clock: Clock) -> Self {
        TimerRegistry { clock, running: HashMap::new(), records: BTreeMap::new() }
    }

    /// Starts the named timer.
    ///
    /// Starting a timer that is already running keeps the original start time.
    pub fn start(&mut self, name: &str) {
        if name.is_empty() || self.running.contains_key(name) {
            return;
        }

        self.running.insert(name.to_owned(), self.clock.now());
    }

    /// Stops the named timer and adds its elapsed time to the record.
    ///
    /// Stopping a timer that is not running does nothing.
    pub fn stop(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }

        if let Some(started) = self.running.remove(name) {
            let elapsed = self.clock.now().saturating_duration_since(started);
            self.record(name, elapsed);
        }
    }

    /// Adds an externally measured duration to the record.
    pub fn record(&mut self, name: &str, elapsed: Duration) {
        if name.is_empty() {
            return;
        }

        let millis = elapsed.as_nanos() as f64 / 1_000_000.0;
        *self.records.entry(name.to_owned()).or_insert(0.0) += millis;
    }

    /// Returns `true` if the named timer is running.
    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    /// Returns every record, rounded up to whole milliseconds.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.records.iter().map(|(name, millis)| (name.clone(), ceil_millis(*millis))).collect()
    }

    /// Returns the named record, rounded up to whole milliseconds.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.records.get(name).map(|millis| ceil_millis(*millis))
    }

    /// Returns `true` if there are no records and no running timers.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.running.is_empty()
    }

    /// Drops all records.
    pub fn clear_records(&mut self) {
        self.records.clear();
    }

    /// Drops all records and running timers.
    pub fn clear(&mut self) {
        self.running.clear();
        self.records.clear();
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        TimerRegistry::new(Clock::new())
    }
}

fn ceil_millis(millis: f64) -> u64 {
    millis.ceil() as u64
}
