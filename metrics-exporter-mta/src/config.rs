use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::statsd::SMALLEST_VALID_PAYLOAD;

pub(crate) const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_SERVER_PORT: u16 = 8125;
pub(crate) const DEFAULT_SAMPLE_RATE: u8 = 100;
pub(crate) const DEFAULT_TAG_PREFIX: &str = "_t_";
pub(crate) const DEFAULT_BEACON: &str = "/_.gif";
pub(crate) const DEFAULT_JSPATH: &str = "/mta.min.js";
pub(crate) const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_PAYLOAD_LEN: usize = 512;
pub(crate) const DEFAULT_PRODUCERS: [&str; 4] = ["page", "network", "resource", "cdn"];

/// Errors that could occur while configuring an account client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The sender kind is not one of the supported transports.
    #[error("unknown data sender '{value}' (expected socket, syslog, echo or browser)")]
    UnknownSender {
        /// The rejected sender kind.
        value: String,
    },

    /// The server endpoint is missing its host or its port.
    #[error("server {missing} is required")]
    IncompleteServer {
        /// Which half of the endpoint was missing.
        missing: &'static str,
    },

    /// The sample rate is outside of `0..=100`.
    #[error("sample rate must be between 0 and 100, got {value}")]
    InvalidSampleRate {
        /// The rejected sample rate.
        value: i64,
    },

    /// A configuration value had the wrong shape for its key.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// Details about why the value was rejected.
        reason: String,
    },

    /// The configuration key is not recognized.
    #[error("unknown configuration key '{key}'")]
    UnknownKey {
        /// The rejected key.
        key: String,
    },
}

impl ConfigError {
    fn invalid<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        ConfigError::InvalidValue { key: key.into(), reason: reason.into() }
    }
}

/// Transport used when an account is flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum SenderKind {
    /// UDP datagrams to the configured statsd server.
    Socket,

    /// Datagrams to the local system log.
    Syslog,

    /// Lines written to standard output.
    Echo,

    /// A command payload for the in-page beacon tracker.
    Browser,
}

impl SenderKind {
    /// Returns the configuration name of the sender kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            SenderKind::Socket => "socket",
            SenderKind::Syslog => "syslog",
            SenderKind::Echo => "echo",
            SenderKind::Browser => "browser",
        }
    }

    /// Returns `true` if this kind hands metric objects to a [`MetricSender`](crate::MetricSender).
    pub const fn is_server_side(self) -> bool {
        !matches!(self, SenderKind::Browser)
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socket" => Ok(SenderKind::Socket),
            "syslog" => Ok(SenderKind::Syslog),
            "echo" => Ok(SenderKind::Echo),
            "browser" => Ok(SenderKind::Browser),
            other => Err(ConfigError::UnknownSender { value: other.to_owned() }),
        }
    }
}

impl TryFrom<String> for SenderKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Deserialize)]
struct RawServerAddr {
    host: Option<String>,
    port: Option<u16>,
}

/// Host and port of a statsd server.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawServerAddr")]
pub struct ServerAddr {
    host: String,
    port: u16,
}

impl ServerAddr {
    /// Creates a new `ServerAddr`.
    ///
    /// # Errors
    ///
    /// If the host is empty, an error is returned.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::IncompleteServer { missing: "host" });
        }
        Ok(ServerAddr { host, port })
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl TryFrom<RawServerAddr> for ServerAddr {
    type Error = ConfigError;

    fn try_from(raw: RawServerAddr) -> Result<Self, Self::Error> {
        let host = raw.host.ok_or(ConfigError::IncompleteServer { missing: "host" })?;
        let port = raw.port.ok_or(ConfigError::IncompleteServer { missing: "port" })?;
        ServerAddr::new(host, port)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Account client configuration.
///
/// Every mutation is validated, deserialization included, so a `Configuration` held by a client is always usable: the
/// sender kind is known, the server endpoint is complete, the sample rate is a percentage, and the write timeout is
/// non-zero.
///
/// Configurations can be assembled with the `with_*` methods, changed key-by-key with [`Configuration::set`], or
/// deserialized from an application's own configuration file using the same camelCase keys.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawConfiguration")]
pub struct Configuration {
    sender: SenderKind,
    server: ServerAddr,
    sample_rate: u8,
    tag_prefix: String,
    beacon: String,
    jspath: String,
    write_timeout: Duration,
    max_payload_len: usize,
    producers: Vec<String>,
}

// Deserialized fields, checked by `Configuration::validate` before use.
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
struct RawConfiguration {
    sender: SenderKind,
    server: ServerAddr,
    sample_rate: u8,
    tag_prefix: String,
    beacon: String,
    jspath: String,
    #[serde(deserialize_with = "deserialize_millis")]
    write_timeout: Duration,
    #[serde(rename = "maxPayloadLength")]
    max_payload_len: usize,
    producers: Vec<String>,
}

impl Default for RawConfiguration {
    fn default() -> Self {
        let Configuration {
            sender,
            server,
            sample_rate,
            tag_prefix,
            beacon,
            jspath,
            write_timeout,
            max_payload_len,
            producers,
        } = Configuration::default();

        RawConfiguration {
            sender,
            server,
            sample_rate,
            tag_prefix,
            beacon,
            jspath,
            write_timeout,
            max_payload_len,
            producers,
        }
    }
}

impl TryFrom<RawConfiguration> for Configuration {
    type Error = ConfigError;

    fn try_from(raw: RawConfiguration) -> Result<Self, Self::Error> {
        let config = Configuration {
            sender: raw.sender,
            server: raw.server,
            sample_rate: raw.sample_rate,
            tag_prefix: raw.tag_prefix,
            beacon: raw.beacon,
            jspath: raw.jspath,
            write_timeout: raw.write_timeout,
            max_payload_len: raw.max_payload_len,
            producers: raw.producers,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Configuration {
    /// Sets the transport used when flushing.
    ///
    /// Defaults to [`SenderKind::Browser`].
    #[must_use]
    pub fn with_sender(mut self, sender: SenderKind) -> Self {
        self.sender = sender;
        self
    }

    /// Sets the statsd server that socket senders send to.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the host is empty, an error is returned.
    pub fn with_server<H: Into<String>>(mut self, host: H, port: u16) -> Result<Self, ConfigError> {
        self.server = ServerAddr::new(host, port)?;
        Ok(self)
    }

    /// Sets the percentage of flush cycles that are actually transmitted.
    ///
    /// Defaults to 100.
    ///
    /// # Errors
    ///
    /// If the rate is greater than 100, an error is returned.
    pub fn with_sample_rate(mut self, sample_rate: u8) -> Result<Self, ConfigError> {
        self.sample_rate = check_sample_rate(i64::from(sample_rate))?;
        Ok(self)
    }

    /// Sets the token prepended to each tag name when building metric keys.
    ///
    /// Defaults to `_t_`.
    #[must_use]
    pub fn with_tag_prefix<P: Into<String>>(mut self, tag_prefix: P) -> Self {
        self.tag_prefix = tag_prefix.into();
        self
    }

    /// Sets the image URL the browser tracker sends beacons to.
    ///
    /// # Errors
    ///
    /// If the URL is empty, an error is returned.
    pub fn with_beacon<U: Into<String>>(mut self, beacon: U) -> Result<Self, ConfigError> {
        self.beacon = non_empty("beacon", beacon.into())?;
        Ok(self)
    }

    /// Sets the path of the tracker script the page loads.
    ///
    /// # Errors
    ///
    /// If the path is empty, an error is returned.
    pub fn with_jspath<U: Into<String>>(mut self, jspath: U) -> Result<Self, ConfigError> {
        self.jspath = non_empty("jspath", jspath.into())?;
        Ok(self)
    }

    /// Sets the write timeout for socket and syslog sends.
    ///
    /// When the write timeout is reached, the payload being sent is dropped without retrying.
    ///
    /// Defaults to 1 second.
    ///
    /// # Errors
    ///
    /// If the timeout is zero, an error is returned.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.write_timeout = check_write_timeout(timeout)?;
        Ok(self)
    }

    /// Sets the maximum length of a single datagram.
    ///
    /// Metric lines are packed into datagrams up to this length. A metric line that cannot fit on its own is dropped.
    ///
    /// Defaults to 512 bytes.
    ///
    /// # Errors
    ///
    /// If the length is too small to hold any metric line, an error is returned.
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Result<Self, ConfigError> {
        self.max_payload_len = check_payload_len(max_payload_len as u64)?;
        Ok(self)
    }

    /// Sets the producers the browser tracker is asked to poll after the server-side data is queued.
    ///
    /// Defaults to `page`, `network`, `resource` and `cdn`.
    #[must_use]
    pub fn with_producers<I, S>(mut self, producers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.producers = producers.into_iter().map(Into::into).collect();
        self
    }

    /// Updates a single configuration key.
    ///
    /// Keys use the same camelCase names as the serialized form: `sender`, `server`, `sampleRate`, `tagPrefix`,
    /// `beacon`, `jspath`, `writeTimeout` (milliseconds), `maxPayloadLength` and `producers`.
    ///
    /// # Errors
    ///
    /// If the key is unknown or the value is invalid for the key, an error is returned and the configuration is left
    /// unchanged.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        match key {
            "sender" => {
                let sender = value.as_str().ok_or_else(|| ConfigError::invalid(key, "expected a string"))?;
                self.sender = sender.parse()?;
            }
            "server" => {
                if !value.is_object() {
                    return Err(ConfigError::invalid(key, "expected an object with host and port"));
                }
                let raw: RawServerAddr =
                    serde_json::from_value(value).map_err(|e| ConfigError::invalid(key, e.to_string()))?;
                self.server = ServerAddr::try_from(raw)?;
            }
            "sampleRate" => {
                let rate = value
                    .as_i64()
                    .or_else(|| value.as_f64().map(|rate| rate as i64))
                    .ok_or_else(|| ConfigError::invalid(key, "expected a number"))?;
                self.sample_rate = check_sample_rate(rate)?;
            }
            "tagPrefix" => {
                let prefix = value.as_str().ok_or_else(|| ConfigError::invalid(key, "expected a string"))?;
                self.tag_prefix = prefix.to_owned();
            }
            "beacon" | "jspath" => {
                let url = value.as_str().ok_or_else(|| ConfigError::invalid(key, "expected a string"))?;
                let url = non_empty(key, url.to_owned())?;
                if key == "beacon" {
                    self.beacon = url;
                } else {
                    self.jspath = url;
                }
            }
            "writeTimeout" => {
                let millis =
                    value.as_u64().ok_or_else(|| ConfigError::invalid(key, "expected milliseconds"))?;
                self.write_timeout = check_write_timeout(Duration::from_millis(millis))?;
            }
            "maxPayloadLength" => {
                let len = value.as_u64().ok_or_else(|| ConfigError::invalid(key, "expected a length"))?;
                self.max_payload_len = check_payload_len(len)?;
            }
            "producers" => {
                self.producers =
                    serde_json::from_value(value).map_err(|e| ConfigError::invalid(key, e.to_string()))?;
            }
            _ => return Err(ConfigError::UnknownKey { key: key.to_owned() }),
        }

        Ok(())
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_sample_rate(i64::from(self.sample_rate))?;
        check_payload_len(self.max_payload_len as u64)?;
        check_write_timeout(self.write_timeout)?;
        non_empty("beacon", self.beacon.clone())?;
        non_empty("jspath", self.jspath.clone())?;
        if self.server.host.is_empty() {
            return Err(ConfigError::IncompleteServer { missing: "host" });
        }
        Ok(())
    }

    /// Returns the sender kind.
    pub fn sender(&self) -> SenderKind {
        self.sender
    }

    /// Returns the statsd server endpoint.
    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Returns the sample rate, as a percentage.
    pub fn sample_rate(&self) -> u8 {
        self.sample_rate
    }

    /// Returns the tag prefix token.
    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }

    /// Returns the beacon image URL.
    pub fn beacon(&self) -> &str {
        &self.beacon
    }

    /// Returns the tracker script path.
    pub fn jspath(&self) -> &str {
        &self.jspath
    }

    /// Returns the write timeout for socket sends.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Returns the maximum datagram length.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    /// Returns the producers polled by the browser tracker.
    pub fn producers(&self) -> &[String] {
        &self.producers
    }

    /// Returns `true` if changing `key` invalidates a cached metric sender.
    pub(crate) fn affects_sender(key: &str) -> bool {
        matches!(key, "sender" | "server" | "writeTimeout" | "maxPayloadLength")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            sender: SenderKind::Browser,
            server: ServerAddr { host: DEFAULT_SERVER_HOST.to_owned(), port: DEFAULT_SERVER_PORT },
            sample_rate: DEFAULT_SAMPLE_RATE,
            tag_prefix: DEFAULT_TAG_PREFIX.to_owned(),
            beacon: DEFAULT_BEACON.to_owned(),
            jspath: DEFAULT_JSPATH.to_owned(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            producers: DEFAULT_PRODUCERS.iter().map(|p| (*p).to_owned()).collect(),
        }
    }
}

fn check_sample_rate(rate: i64) -> Result<u8, ConfigError> {
    u8::try_from(rate)
        .ok()
        .filter(|rate| *rate <= 100)
        .ok_or(ConfigError::InvalidSampleRate { value: rate })
}

fn check_payload_len(len: u64) -> Result<usize, ConfigError> {
    let len = usize::try_from(len)
        .ok()
        .filter(|len| u32::try_from(*len).is_ok())
        .ok_or_else(|| ConfigError::invalid("maxPayloadLength", "must be less than 2^32 bytes"))?;
    if len < SMALLEST_VALID_PAYLOAD.len() {
        return Err(ConfigError::invalid(
            "maxPayloadLength",
            format!("must be {} or greater", SMALLEST_VALID_PAYLOAD.len()),
        ));
    }
    Ok(len)
}

// Sockets reject a zero write timeout.
fn check_write_timeout(timeout: Duration) -> Result<Duration, ConfigError> {
    if timeout.is_zero() {
        Err(ConfigError::invalid("writeTimeout", "must be greater than zero"))
    } else {
        Ok(timeout)
    }
}

fn non_empty(key: &str, value: String) -> Result<String, ConfigError> {
    if value.is_empty() {
        Err(ConfigError::invalid(key, "must not be empty"))
    } else {
        Ok(value)
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::default();
        assert_eq!(config.sender(), SenderKind::Browser);
        assert_eq!(config.server().to_string(), "127.0.0.1:8125");
        assert_eq!(config.sample_rate(), 100);
        assert_eq!(config.tag_prefix(), "_t_");
        assert_eq!(config.producers(), ["page", "network", "resource", "cdn"]);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn set_known_keys() {
        let mut config = Configuration::default();
        config.set("sender", json!("echo")).unwrap();
        config.set("server", json!({"host": "stats.local", "port": 9125})).unwrap();
        config.set("sampleRate", json!(25)).unwrap();
        config.set("tagPrefix", json!("t_")).unwrap();
        config.set("beacon", json!("http://127.0.0.1:8888/_.gif")).unwrap();
        config.set("writeTimeout", json!(250)).unwrap();

        assert_eq!(config.sender(), SenderKind::Echo);
        assert_eq!(config.server().host(), "stats.local");
        assert_eq!(config.server().port(), 9125);
        assert_eq!(config.sample_rate(), 25);
        assert_eq!(config.tag_prefix(), "t_");
        assert_eq!(config.beacon(), "http://127.0.0.1:8888/_.gif");
        assert_eq!(config.write_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let mut config = Configuration::default();
        let err = config.set("sender", json!("carrier-pigeon")).unwrap_err();
        assert_eq!(err, ConfigError::UnknownSender { value: "carrier-pigeon".to_owned() });
        assert_eq!(config.sender(), SenderKind::Browser);
    }

    #[test]
    fn incomplete_server_is_rejected() {
        let mut config = Configuration::default();
        assert_eq!(
            config.set("server", json!({"host": "stats.local"})),
            Err(ConfigError::IncompleteServer { missing: "port" })
        );
        assert_eq!(
            config.set("server", json!({"port": 8125})),
            Err(ConfigError::IncompleteServer { missing: "host" })
        );
        assert!(matches!(
            config.set("server", json!("stats.local:8125")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(config.server().to_string(), "127.0.0.1:8125");
    }

    #[test]
    fn sample_rate_bounds() {
        let mut config = Configuration::default();
        assert_eq!(
            config.set("sampleRate", json!(101)),
            Err(ConfigError::InvalidSampleRate { value: 101 })
        );
        assert_eq!(
            config.set("sampleRate", json!(-1)),
            Err(ConfigError::InvalidSampleRate { value: -1 })
        );
        config.set("sampleRate", json!(0)).unwrap();
        assert_eq!(config.sample_rate(), 0);
        assert!(Configuration::default().with_sample_rate(200).is_err());
    }

    #[test]
    fn unknown_key_and_empty_urls() {
        let mut config = Configuration::default();
        assert_eq!(
            config.set("debug", json!(true)),
            Err(ConfigError::UnknownKey { key: "debug".to_owned() })
        );
        assert!(config.set("jspath", json!("")).is_err());
        assert!(Configuration::default().with_beacon("").is_err());
        assert!(Configuration::default().with_maximum_payload_length(2).is_err());
    }

    #[test]
    fn deserialize_from_json() {
        let config: Configuration = serde_json::from_value(json!({
            "sender": "socket",
            "server": {"host": "10.0.0.1", "port": 8125},
            "sampleRate": 10,
            "writeTimeout": 50,
        }))
        .unwrap();

        assert_eq!(config.sender(), SenderKind::Socket);
        assert_eq!(config.server().host(), "10.0.0.1");
        assert_eq!(config.sample_rate(), 10);
        assert_eq!(config.write_timeout(), Duration::from_millis(50));
        assert_eq!(config.tag_prefix(), "_t_");
        assert_eq!(config.validate(), Ok(()));

        let err = serde_json::from_value::<Configuration>(json!({"sender": "fax"}));
        assert!(err.is_err());
    }

    #[test]
    fn deserialize_rejects_invalid_values() {
        for invalid in [json!({"sampleRate": 200}), json!({"beacon": ""}), json!({"writeTimeout": 0})] {
            assert!(serde_json::from_value::<Configuration>(invalid).is_err());
        }
    }

    #[test]
    fn zero_write_timeout_is_rejected() {
        let mut config = Configuration::default();
        assert_eq!(
            config.set("writeTimeout", json!(0)),
            Err(ConfigError::InvalidValue {
                key: "writeTimeout".to_owned(),
                reason: "must be greater than zero".to_owned()
            })
        );
        assert_eq!(config.write_timeout(), Duration::from_secs(1));
        assert!(Configuration::default().with_write_timeout(Duration::ZERO).is_err());
        assert_eq!(
            Configuration::default().with_write_timeout(Duration::from_millis(5)).unwrap().write_timeout(),
            Duration::from_millis(5)
        );
    }
}
