//! Metric senders.
//!
//! A [`MetricSender`] takes the metric objects built during a flush and transmits them. Sends are fire-and-forget:
//! the caller logs failures but never retries them.

use std::io;

use crate::{
    config::{Configuration, SenderKind},
    statsd::{PayloadWriter, StatsdMetric},
};

mod echo;
pub use self::echo::EchoSender;

mod socket;
pub use self::socket::SocketSender;

mod syslog;
pub use self::syslog::{SyslogSender, DEFAULT_SYSLOG_PATH};

/// Transmits metric objects.
pub trait MetricSender: Send {
    /// Sends a batch of metrics, returning the number of bytes sent.
    ///
    /// # Errors
    ///
    /// If the underlying transport fails, an error is returned. Partially sent batches are not rolled back.
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize>;
}

impl<S: MetricSender + ?Sized> MetricSender for Box<S> {
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize> {
        (**self).send(metrics)
    }
}

/// Builds the metric sender for an account's configuration.
///
/// Clients build their sender lazily on the first server-side flush, and again whenever a transport-related
/// configuration key changes.
pub trait SenderFactory: Send + Sync {
    /// Builds a sender for `config`.
    ///
    /// # Errors
    ///
    /// If the transport cannot be set up, an error is returned.
    fn build(&self, config: &Configuration) -> io::Result<Box<dyn MetricSender>>;
}

impl<F> SenderFactory for F
where
    F: Fn(&Configuration) -> io::Result<Box<dyn MetricSender>> + Send + Sync,
{
    fn build(&self, config: &Configuration) -> io::Result<Box<dyn MetricSender>> {
        self(config)
    }
}

/// Builds the sender that matches the configured [`SenderKind`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSenderFactory;

impl SenderFactory for DefaultSenderFactory {
    fn build(&self, config: &Configuration) -> io::Result<Box<dyn MetricSender>> {
        match config.sender() {
            SenderKind::Echo => Ok(Box::new(EchoSender::stdout(config.max_payload_len()))),
            SenderKind::Syslog => Ok(Box::new(SyslogSender::new(config.max_payload_len(), config.write_timeout()))),
            SenderKind::Socket => Ok(Box::new(SocketSender::new(config)?)),
            SenderKind::Browser => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "browser accounts do not use a metric sender",
            )),
        }
    }
}

/// Packs `metrics` into payloads and hands each one to `send`, returning the total bytes sent.
///
/// Every payload is attempted even if an earlier one failed; the first error is returned once all have been tried.
pub(crate) fn send_payloads<F>(writer: &mut PayloadWriter, metrics: &[StatsdMetric], mut send: F) -> io::Result<usize>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    for metric in metrics {
        if !writer.write(metric) {
            tracing::error!(metric_name = metric.key(), "Metric line exceeds the maximum payload length; dropped.");
        }
    }

    let mut bytes_sent = 0;
    let mut first_error = None;
    for payload in writer.drain_payloads() {
        match send(&payload) {
            Ok(n) => bytes_sent += n,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(bytes_sent),
    }
}
