use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use tracing::debug;

use super::{send_payloads, MetricSender};
use crate::statsd::{PayloadWriter, StatsdMetric};

/// Default path of the local syslog socket.
pub const DEFAULT_SYSLOG_PATH: &str = "/dev/log";

// RFC 3164 priority for facility `user` (1) and severity `info` (6).
const SYSLOG_HEADER: &[u8] = b"<14>mta: ";

enum SyslogState {
    Inconsistent,
    Disconnected,
    #[cfg(unix)]
    Ready(UnixDatagram),
}

struct Connection {
    path: PathBuf,
    write_timeout: Duration,
    state: SyslogState,
    message: Vec<u8>,
}

impl Connection {
    #[cfg(unix)]
    fn connect(&self) -> io::Result<UnixDatagram> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(&self.path)?;
        socket.set_write_timeout(Some(self.write_timeout))?;
        debug!(path = %self.path.display(), "Connected syslog socket.");
        Ok(socket)
    }

    #[cfg(unix)]
    fn try_send(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.message.clear();
        self.message.extend_from_slice(SYSLOG_HEADER);
        self.message.extend_from_slice(payload);

        loop {
            match std::mem::replace(&mut self.state, SyslogState::Inconsistent) {
                SyslogState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                SyslogState::Disconnected => match self.connect() {
                    Ok(socket) => self.state = SyslogState::Ready(socket),
                    Err(e) => {
                        self.state = SyslogState::Disconnected;
                        return Err(e);
                    }
                },
                SyslogState::Ready(socket) => {
                    let result = socket.send(&self.message).map(|_| payload.len());
                    self.state = if result.is_ok() { SyslogState::Ready(socket) } else { SyslogState::Disconnected };
                    return result;
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn try_send(&mut self, _payload: &[u8]) -> io::Result<usize> {
        self.state = SyslogState::Disconnected;
        Err(io::Error::new(io::ErrorKind::Unsupported, "syslog sender requires a Unix domain socket"))
    }
}

/// Sends metrics to the local system log.
///
/// Each payload becomes one RFC 3164 message tagged `mta` with `user.info` priority, written to the syslog datagram
/// socket. The socket is opened on first send.
pub struct SyslogSender {
    conn: Connection,
    writer: PayloadWriter,
}

impl SyslogSender {
    /// Creates a `SyslogSender` that writes to [`DEFAULT_SYSLOG_PATH`].
    pub fn new(max_payload_len: usize, write_timeout: Duration) -> Self {
        SyslogSender::with_path(DEFAULT_SYSLOG_PATH, max_payload_len, write_timeout)
    }

    /// Creates a `SyslogSender` that writes to the syslog socket at `path`.
    pub fn with_path<P: AsRef<Path>>(path: P, max_payload_len: usize, write_timeout: Duration) -> Self {
        SyslogSender {
            conn: Connection {
                path: path.as_ref().to_path_buf(),
                write_timeout,
                state: SyslogState::Disconnected,
                message: Vec::new(),
            },
            writer: PayloadWriter::new(max_payload_len),
        }
    }
}

impl MetricSender for SyslogSender {
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize> {
        let conn = &mut self.conn;
        send_payloads(&mut self.writer, metrics, |payload| conn.try_send(payload))
    }
}
