use std::{
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _, UdpSocket},
    time::Duration,
};

use tracing::debug;

use super::{send_payloads, MetricSender};
use crate::{
    config::Configuration,
    statsd::{PayloadWriter, StatsdMetric},
};

enum SocketState {
    // Intermediate state during send attempts.
    Inconsistent,

    // Not connected; the next send connects first.
    Disconnected,

    // Connected and ready to send.
    Ready(UdpSocket),
}

struct Connection {
    addrs: Vec<SocketAddr>,
    write_timeout: Duration,
    state: SocketState,
}

impl Connection {
    fn connect(&self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(&self.addrs[..])?;
        socket.set_write_timeout(Some(self.write_timeout))?;
        debug!(addrs = ?self.addrs, "Connected statsd socket.");
        Ok(socket)
    }

    fn try_send(&mut self, payload: &[u8]) -> io::Result<usize> {
        loop {
            match std::mem::replace(&mut self.state, SocketState::Inconsistent) {
                SocketState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                SocketState::Disconnected => match self.connect() {
                    Ok(socket) => self.state = SocketState::Ready(socket),
                    Err(e) => {
                        self.state = SocketState::Disconnected;
                        return Err(e);
                    }
                },
                SocketState::Ready(socket) => {
                    let result = socket.send(payload);
                    self.state = if result.is_ok() { SocketState::Ready(socket) } else { SocketState::Disconnected };
                    return result;
                }
            }
        }
    }
}

/// Sends metrics as UDP datagrams to a statsd server.
///
/// The socket is connected lazily and re-created after a failed send. Each send is bounded by the configured write
/// timeout.
pub struct SocketSender {
    conn: Connection,
    writer: PayloadWriter,
}

impl SocketSender {
    /// Creates a `SocketSender` for the server in `config`.
    ///
    /// # Errors
    ///
    /// If the server host cannot be resolved, an error is returned.
    pub fn new(config: &Configuration) -> io::Result<Self> {
        let server = config.server();
        let addrs: Vec<SocketAddr> = (server.host(), server.port()).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for {server}")));
        }

        Ok(SocketSender {
            conn: Connection { addrs, write_timeout: config.write_timeout(), state: SocketState::Disconnected },
            writer: PayloadWriter::new(config.max_payload_len()),
        })
    }
}

impl MetricSender for SocketSender {
    fn send(&mut self, metrics: &[StatsdMetric]) -> io::Result<usize> {
        let conn = &mut self.conn;
        send_payloads(&mut self.writer, metrics, |payload| conn.try_send(payload))
    }
}
