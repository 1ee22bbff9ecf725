use std::time::Duration;

/// Connection policy knobs.
///
/// The defaults match long-standing SeedLink client practice: a 60 s I/O
/// timeout, a 10-minute idle timeout, a 30 s reconnect delay, and no
/// keepalives unless asked for.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Client program name, reported to v4 servers via `USERAGENT`.
    pub client_name: Option<String>,
    /// Client program version, appended as `name/version`.
    pub client_version: Option<String>,
    /// Negotiate protocol 4 when the server offers it. Default: `true`.
    pub prefer_v4: bool,
    /// Start of the global time window (ISO-8601 or comma form).
    pub begin_time: Option<String>,
    /// End of the global time window.
    pub end_time: Option<String>,
    /// Interval between keepalive probes; `None` disables them.
    pub keepalive: Option<Duration>,
    /// Idle timeout: reconnect when nothing arrives for this long.
    /// `None` disables the check. Default: 600 s.
    pub network_timeout: Option<Duration>,
    /// Delay before reconnecting after a network failure. Default: 30 s.
    pub reconnect_delay: Duration,
    /// Timeout applied to individual network sends and receives.
    pub io_timeout: Duration,
    /// Timeout for TCP connection establishment. Default: 10 s.
    pub connect_timeout: Duration,
    /// Return [`Collect::NoPacket`](crate::Collect::NoPacket) instead of
    /// waiting when no data is available. Default: `false`.
    pub non_blocking: bool,
    /// Dial-up mode: request buffered data with `FETCH` and expect the
    /// server to end the stream when the window is exhausted.
    pub dialup: bool,
    /// Ask v3 servers (>= 3.1) to suppress per-command responses during
    /// negotiation.
    pub batch: bool,
    /// Resume from tracked sequence numbers on reconnect. Default: `true`.
    pub resume: bool,
    /// Append the last packet time to v3 resume requests (servers
    /// >= 2.93). Default: `true`.
    pub last_packet_time: bool,
    /// Largest payload [`next_packet`](crate::SeedLinkConnection::next_packet)
    /// will grow its internal buffer to. Default: 1 MiB.
    pub max_owned_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            client_version: None,
            prefer_v4: true,
            begin_time: None,
            end_time: None,
            keepalive: None,
            network_timeout: Some(Duration::from_secs(600)),
            reconnect_delay: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            non_blocking: false,
            dialup: false,
            batch: false,
            resume: true,
            last_packet_time: true,
            max_owned_payload: 1 << 20,
        }
    }
}
