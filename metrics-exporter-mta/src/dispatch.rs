//! Flush output for both transports.
//!
//! Server-side accounts turn their buffer into [`StatsdMetric`] objects for a metric sender. Browser accounts turn it
//! into a [`BeaconPayload`]: an ordered list of [`Command`]s that the page hands to the beacon tracker.

use serde::{de::DeserializeOwned, ser::SerializeSeq as _, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::{
    buffer::{MetricBuffer, MetricKind},
    config::Configuration,
    key::{KeyBuilder, Tags},
    measurement::Measurement,
    statsd::StatsdMetric,
};

/// Name of the global queueing function defined by the [`InitBlock`].
pub const TRACKER_GLOBAL: &str = "mta";

/// Category under which server-side buffers are sent to the tracker.
pub const SERVER_CATEGORY: &str = "server";

/// Largest counter value that is expanded into unit increments.
///
/// Larger counters are sent as a single `key:N|c` line.
pub const MAX_EXPANDED_COUNT: u64 = 1_000;

/// Result of a single flush cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was buffered, so the transport was not used.
    Empty,

    /// The cycle lost the sampling draw and was discarded.
    Sampled,

    /// Metrics were handed to the metric sender.
    Sent {
        /// Number of metric objects sent.
        metrics: usize,

        /// Number of bytes written by the sender.
        bytes: usize,
    },

    /// The metric sender failed, and the metrics were dropped.
    ///
    /// The failure has already been logged. It is reported here for inspection only; delivery is at-most-once.
    Dropped {
        /// Number of metric objects that were dropped.
        metrics: usize,
    },

    /// Commands for the browser tracker.
    Beacon(BeaconPayload),
}

impl FlushOutcome {
    /// Returns `true` if metrics were handed to a transport successfully.
    pub fn is_sent(&self) -> bool {
        matches!(self, FlushOutcome::Sent { .. } | FlushOutcome::Beacon(_))
    }

    /// Returns the beacon payload, if this was a browser flush.
    pub fn into_beacon(self) -> Option<BeaconPayload> {
        match self {
            FlushOutcome::Beacon(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Page bootstrap for the beacon tracker.
///
/// The bootstrap defines a global queueing function, [`TRACKER_GLOBAL`], that stores commands until the tracker script
/// has loaded and replays them. It must run before any command is queued, and only once per page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InitBlock {
    global: String,
}

impl InitBlock {
    pub(crate) fn new() -> Self {
        InitBlock { global: TRACKER_GLOBAL.to_owned() }
    }

    /// Returns the name of the global queueing function.
    pub fn global(&self) -> &str {
        &self.global
    }
}

/// Everything a page needs to report an account's metrics through the beacon tracker.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<InitBlock>,
    account: String,
    script_src: String,
    commands: Vec<Command>,
}

impl BeaconPayload {
    /// Returns the page bootstrap, present only on an account's first browser flush.
    pub fn header(&self) -> Option<&InitBlock> {
        self.header.as_ref()
    }

    /// Returns the account name.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the path of the tracker script the page should load.
    pub fn script_src(&self) -> &str {
        &self.script_src
    }

    /// Returns the queued commands, in order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Consumes the payload, returning the queued commands.
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Errors that could occur while parsing a tracker command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The argument list was empty.
    #[error("empty command")]
    Empty,

    /// The command name was not a string.
    #[error("command name must be a string")]
    InvalidName,

    /// The command is not one the tracker understands.
    #[error("unknown command '{name}'")]
    UnknownCommand {
        /// The rejected command name.
        name: String,
    },

    /// A required argument was missing or had the wrong type.
    #[error("command '{command}' has an invalid '{argument}' argument")]
    InvalidArgument {
        /// The command name.
        command: &'static str,

        /// The argument name.
        argument: &'static str,
    },
}

/// A beacon tracker command.
///
/// Commands are written as JSON argument arrays, the form in which pages queue them: `["create", "www"]` or
/// `["create", "www", {"useCombo": false}]`, `["config", "sampleRate", 50]`, `["tag", "server", "web01"]` and `["send", "server", {"req": 10}, "timer"]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Starts reporting for an application.
    Create {
        /// Application, or account, name.
        app: String,

        /// Tracker settings merged over the current ones: `sampleRate`, `useCombo` and `beacon`.
        settings: Option<Map<String, Value>>,
    },

    /// Changes a tracker setting.
    Config {
        /// Setting name, such as `beaconImage` or `sampleRate`.
        key: String,

        /// New value.
        value: Value,
    },

    /// Sets, or removes when `value` is `None`, a tag sent with every beacon.
    Tag {
        /// Tag name.
        key: String,

        /// Tag value.
        value: Option<String>,
    },

    /// Queues data for the next beacon.
    ///
    /// When a producer is registered for `category`, its data is used and `data` is ignored.
    Send {
        /// Data category, such as `server` or `page`.
        category: String,

        /// Data to send.
        data: Option<Measurement>,

        /// Metric kind of the data.
        kind: Option<MetricKind>,
    },
}

impl Command {
    /// Returns the command as a JSON argument array.
    pub fn to_args(&self) -> Vec<Value> {
        match self {
            Command::Create { app, settings } => {
                let mut args = vec![Value::from("create"), Value::from(app.as_str())];
                if let Some(settings) = settings {
                    args.push(Value::Object(settings.clone()));
                }
                args
            }
            Command::Config { key, value } => vec![Value::from("config"), Value::from(key.as_str()), value.clone()],
            Command::Tag { key, value } => {
                let mut args = vec![Value::from("tag"), Value::from(key.as_str())];
                if let Some(value) = value {
                    args.push(Value::from(value.as_str()));
                }
                args
            }
            Command::Send { category, data, kind } => {
                let mut args = vec![Value::from("send"), Value::from(category.as_str())];
                if data.is_some() || kind.is_some() {
                    args.push(data.as_ref().map_or(Value::Null, |data| {
                        serde_json::to_value(data).unwrap_or(Value::Null)
                    }));
                }
                if let Some(kind) = kind {
                    args.push(Value::from(kind.as_str()));
                }
                args
            }
        }
    }

    /// Parses a JSON argument array.
    ///
    /// # Errors
    ///
    /// If the command is unknown or an argument is missing or malformed, an error is returned.
    pub fn from_args(args: &[Value]) -> Result<Command, CommandError> {
        let (name, rest) = args.split_first().ok_or(CommandError::Empty)?;
        let name = name.as_str().ok_or(CommandError::InvalidName)?;

        match name {
            "create" => {
                let app = string_arg(rest.first(), "create", "app")?;
                let settings = optional_arg(rest.get(1), "create", "settings")?;
                Ok(Command::Create { app, settings })
            }
            "config" => {
                let key = string_arg(rest.first(), "config", "key")?;
                let value = rest.get(1).cloned().unwrap_or(Value::Null);
                Ok(Command::Config { key, value })
            }
            "tag" => {
                let key = string_arg(rest.first(), "tag", "key")?;
                let value = match rest.get(1) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    Some(Value::Bool(b)) => Some(b.to_string()),
                    Some(_) => return Err(CommandError::InvalidArgument { command: "tag", argument: "value" }),
                };
                Ok(Command::Tag { key, value })
            }
            "send" => {
                let category = string_arg(rest.first(), "send", "category")?;
                let data = optional_arg(rest.get(1), "send", "data")?;
                let kind = optional_arg(rest.get(2), "send", "kind")?;
                Ok(Command::Send { category, data, kind })
            }
            // Shorthands for `send` with a fixed kind.
            "timing" | "count" | "gauge" => {
                let (command, kind) = match name {
                    "timing" => ("timing", MetricKind::Timer),
                    "count" => ("count", MetricKind::Counter),
                    _ => ("gauge", MetricKind::Gauge),
                };
                let category = string_arg(rest.first(), command, "category")?;
                let data = optional_arg(rest.get(1), command, "data")?;
                Ok(Command::Send { category, data, kind: Some(kind) })
            }
            other => Err(CommandError::UnknownCommand { name: other.to_owned() }),
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let args = self.to_args();
        let mut seq = serializer.serialize_seq(Some(args.len()))?;
        for arg in &args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

fn string_arg(value: Option<&Value>, command: &'static str, argument: &'static str) -> Result<String, CommandError> {
    value
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or(CommandError::InvalidArgument { command, argument })
}

fn optional_arg<T: DeserializeOwned>(
    value: Option<&Value>, command: &'static str, argument: &'static str,
) -> Result<Option<T>, CommandError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(|_| CommandError::InvalidArgument { command, argument }),
    }
}

/// Builds the metric objects for a server-side flush.
///
/// Timers and gauges produce one object each. A counter with value `n` produces `n` unit increments, the format the
/// statsd collector aggregates, unless `n` is above [`MAX_EXPANDED_COUNT`], in which case it produces one object
/// carrying the whole count.
pub(crate) fn build_metrics(buffer: &MetricBuffer, keys: &KeyBuilder<'_>) -> Vec<StatsdMetric> {
    let mut metrics = Vec::with_capacity(buffer.len());

    for (name, millis) in buffer.timers() {
        metrics.push(StatsdMetric::timing(keys.build(name), *millis));
    }
    for (name, count) in buffer.counters() {
        let key = keys.build(name);
        if *count > MAX_EXPANDED_COUNT {
            warn!(metric_name = %key, count, "Counter too large to expand; sending as a single increment.");
            metrics.push(StatsdMetric::count(key, *count));
            continue;
        }
        for _ in 0..*count {
            metrics.push(StatsdMetric::increment(key.clone()));
        }
    }
    for (name, value) in buffer.gauges() {
        metrics.push(StatsdMetric::gauge(keys.build(name), *value));
    }

    metrics
}

/// Builds the beacon payload for a browser flush.
pub(crate) fn build_beacon(
    account: &str, config: &Configuration, tags: &Tags, buffer: &MetricBuffer, header: Option<InitBlock>,
) -> BeaconPayload {
    let mut commands = vec![
        Command::Create { app: account.to_owned(), settings: None },
        Command::Config { key: "beaconImage".to_owned(), value: Value::from(config.beacon()) },
        Command::Config { key: "sampleRate".to_owned(), value: Value::from(config.sample_rate()) },
    ];

    for (key, value) in tags.iter() {
        commands.push(Command::Tag { key: key.to_owned(), value: Some(value.to_owned()) });
    }

    for kind in [MetricKind::Timer, MetricKind::Counter, MetricKind::Gauge] {
        if let Some(data) = buffer.to_measurement(kind) {
            commands.push(Command::Send { category: SERVER_CATEGORY.to_owned(), data: Some(data), kind: Some(kind) });
        }
    }

    for producer in config.producers() {
        commands.push(Command::Send { category: producer.clone(), data: None, kind: None });
    }

    BeaconPayload {
        header,
        account: account.to_owned(),
        script_src: config.jspath().to_owned(),
        commands,
    }
}
