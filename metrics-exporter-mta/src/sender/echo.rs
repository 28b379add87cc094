use std::io::{self, Write};

use super::{send_payloads, MetricSender};
use crate::statsd::{PayloadWriter, StatsdMetric};

/// Writes each payload to an output stream, one metric per line.
///
/// Intended for debugging: the output is exactly what a socket sender would put on the wire.
pub struct EchoSender<W = io::Stdout> {
    out: W,
    writer: PayloadWriter,
}

impl EchoSender<io::Stdout> {
    /// Creates an `EchoSender` that writes to standard output.
    pub fn stdout(max_payload_len: usize) -> Self {
        EchoSender::new(io::stdout(), max_payload_len)
    }
}

impl<W: Write + Send> EchoSender<W> {
    /// Creates an `EchoSender` that writes to `out`.
    pub fn new(out: W, max_payload_len: usize) -> Self {
        EchoSender { out, writer: PayloadWriter::new(max_payload_len) }
    }

    /// Consumes the sender, returning the output stream.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> MetricSender for EchoSender<W> {
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize> {
        let out = &mut self.out;
        let sent = send_payloads(&mut self.writer, metrics, |payload| {
            out.write_all(payload)?;
            out.write_all(b"\n")?;
            Ok(payload.len())
        })?;
        self.out.flush()?;
        Ok(sent)
    }
}
