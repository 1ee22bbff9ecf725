use std::io::ErrorKind;
use std::time::Duration;

use slink_protocol::{Command, ProtocolVersion};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};

/// Longest total wait for a command response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for response bytes.
const RESPONSE_POLL: Duration = Duration::from_millis(50);
/// Longest single response line accepted.
pub(crate) const MAX_RESPONSE: usize = 200;

/// Split `host[:port]` or `host@port` into host and port, applying the
/// defaults `localhost` and `18000`.
///
/// A malformed port is a permanent configuration error; the driver
/// refuses further reconnection attempts when it sees one.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = match address.split_once(['@', ':']) {
        None => (address, ""),
        Some((host, port)) => (host, port),
    };

    let host = if host.is_empty() { "localhost" } else { host };
    if port.is_empty() {
        return Ok((host.to_owned(), 18000));
    }

    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok((host.to_owned(), port)),
        _ => Err(ClientError::BadAddress(address.to_owned())),
    }
}

/// A non-blocking TCP link to a SeedLink server.
///
/// Command/response traffic goes through [`send_command`] and
/// [`recv_response`]; the streaming phase uses [`recv_available`] and
/// [`poll_readable`], which never block past their poll window.
///
/// [`send_command`]: Transport::send_command
/// [`recv_response`]: Transport::recv_response
/// [`recv_available`]: Transport::recv_available
/// [`poll_readable`]: Transport::poll_readable
pub(crate) struct Transport {
    stream: TcpStream,
    io_timeout: Duration,
}

impl Transport {
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        debug!(host, port, "opening network socket");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))??;

        stream.set_nodelay(true).ok();

        Ok(Self { stream, io_timeout })
    }

    pub async fn send_command(&mut self, command: &Command, version: ProtocolVersion) -> Result<()> {
        trace!(command = command.name(), "sending");
        let wire = command.to_wire(version)?;
        self.send(&wire).await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        tokio::time::timeout(self.io_timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout(self.io_timeout))??;
        Ok(())
    }

    /// Read one CR-LF-terminated response line, a byte at a time, waiting
    /// up to thirty seconds in 50 ms slices.
    pub async fn recv_response(&mut self, max: usize) -> Result<String> {
        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        let mut line: Vec<u8> = Vec::with_capacity(64);
        let mut byte = [0u8; 1];

        while line.len() < max {
            match self.stream.try_read(&mut byte) {
                Ok(0) => return Err(ClientError::Disconnected),
                Ok(_) => {
                    line.push(byte[0]);
                    if line.ends_with(b"\r\n") {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::Timeout(RESPONSE_TIMEOUT));
                    }
                    tokio::time::sleep(RESPONSE_POLL).await;
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Read whatever is available into `buffer` without waiting.
    ///
    /// Returns `Ok(0)` when the socket has nothing to offer; an EOF from
    /// the server maps to [`ClientError::Disconnected`].
    pub fn recv_available(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.stream.try_read(buffer) {
            Ok(0) => Err(ClientError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    /// Wait up to `window` for the socket to become readable.
    pub async fn poll_readable(&self, window: Duration) -> bool {
        matches!(
            tokio::time::timeout(window, self.stream.ready(Interest::READABLE)).await,
            Ok(Ok(_))
        )
    }
}
