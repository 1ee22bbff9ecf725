//! The collection driver: a connection description plus the state
//! machine that connects, negotiates, and frames packets out of the
//! receive stream.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slink_protocol::frame::{FrameHeader, V3_HEADER_LEN, V4_HEADER_LEN};
use slink_protocol::inspect::{self, Detection, MAX_PAYLOAD, MIN_PAYLOAD};
use slink_protocol::payload::{PayloadFormat, SUBFORMAT_INFO};
use slink_protocol::timeutil::now_ns;
use slink_protocol::{Command, InfoLevel, ProtocolVersion, SequenceNumber};
use tracing::{debug, error, info, trace, warn};

use crate::auth::AuthProvider;
use crate::config::ClientConfig;
use crate::connection::{parse_address, Transport};
use crate::error::{ClientError, Result};
use crate::negotiate::{self, ServerInfo};
use crate::statefile;
use crate::streams::StreamRegistry;

/// Receive buffer size.
const RECV_BUFFER_LEN: usize = MAX_PAYLOAD;
/// Transport poll window per iteration in blocking mode.
const BLOCKING_POLL: Duration = Duration::from_millis(500);
/// Transport poll window per iteration in non-blocking mode.
const NONBLOCKING_POLL: Duration = Duration::from_millis(1);
/// Nap while waiting out the reconnect delay.
const RECONNECT_NAP: Duration = Duration::from_millis(500);
/// Chunk size while buffering a v3 payload of unknown length.
const DETECT_CHUNK: usize = 128;

/// Metadata of the packet currently being collected or just returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketInfo {
    /// Packet sequence number; `UNSET` for v3 INFO packets.
    pub seqnum: SequenceNumber,
    /// Total payload length; `0` until determined.
    pub payload_length: u32,
    /// Payload bytes collected into the caller's buffer so far.
    pub payload_collected: u32,
    /// `NET_STA` station id; empty until known.
    pub station_id: String,
    pub payload_format: PayloadFormat,
    pub payload_subformat: u8,
}

impl PacketInfo {
    fn empty() -> Self {
        Self {
            seqnum: SequenceNumber::UNSET,
            payload_length: 0,
            payload_collected: 0,
            station_id: String::new(),
            payload_format: PayloadFormat::Unknown,
            payload_subformat: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::empty();
    }
}

/// Outcome of one [`SeedLinkConnection::collect`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Collect {
    /// A complete packet was written to the caller's buffer.
    Packet(PacketInfo),
    /// Non-blocking mode and nothing is ready.
    NoPacket,
    /// The next payload does not fit the caller's buffer. Re-enter with
    /// a buffer of at least `payload_length` bytes holding the already
    /// collected prefix.
    TooLarge(PacketInfo),
    /// The connection has ended; further calls return this immediately.
    Terminate,
}

/// Cloneable termination flag.
///
/// The single atomic write is safe from signal handlers and other
/// threads. Termination is graceful: the driver first flushes whole
/// packets still buffered, then disconnects.
#[derive(Clone, Debug)]
pub struct TerminateHandle(Arc<AtomicU8>);

impl TerminateHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    /// Request termination.
    pub fn terminate(&self) {
        self.0.fetch_max(1, Ordering::Relaxed);
    }

    pub fn is_terminated(&self) -> bool {
        self.level() > 0
    }

    fn level(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    fn escalate(&self) {
        self.0.fetch_max(2, Ordering::Relaxed);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Down,
    Up,
    Streaming,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StreamState {
    Header,
    StationId,
    Payload,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum QueryState {
    Idle,
    InfoQuery,
    KeepAliveQuery,
}

/// One step of the framer over the receive buffer.
enum Step {
    NeedMore,
    Packet,
    TooLarge,
    EndOfStream,
    ServerError,
    Corrupt(String),
}

/// One step of payload assembly.
enum PayloadStep {
    NeedMore,
    TooLarge,
    Complete { deliver: bool },
    Corrupt(String),
}

/// A SeedLink connection description and its runtime state.
///
/// Configure subscriptions, then call [`collect`] in a loop; it drives
/// connect → negotiate → stream and yields one status per call,
/// transparently reconnecting, probing with keepalives, and resuming
/// from tracked sequence numbers.
///
/// ```no_run
/// # async fn example() -> slink_client::Result<()> {
/// use slink_client::{Collect, SeedLinkConnection};
/// use slink_protocol::SequenceNumber;
///
/// let mut conn = SeedLinkConnection::new("rtserve.iris.washington.edu:18000");
/// conn.add_stream("IU_ANMO", Some("BHZ"), SequenceNumber::UNSET, None)?;
///
/// let mut buffer = vec![0u8; 16384];
/// loop {
///     match conn.collect(&mut buffer).await {
///         Collect::Packet(packet) => {
///             println!("{} {} bytes", packet.station_id, packet.payload_length);
///         }
///         Collect::TooLarge(packet) => {
///             buffer.resize(packet.payload_length as usize, 0);
///         }
///         Collect::NoPacket => continue,
///         Collect::Terminate => break,
///     }
/// }
/// # Ok(())
/// # }
/// ```
///
/// [`collect`]: SeedLinkConnection::collect
pub struct SeedLinkConnection {
    address: String,
    config: ClientConfig,
    streams: StreamRegistry,
    auth: Option<Box<dyn AuthProvider>>,

    transport: Option<Transport>,
    server: Option<ServerInfo>,
    protocol: ProtocolVersion,
    batch_active: bool,
    pending_info: Option<InfoLevel>,
    terminate: TerminateHandle,

    conn_state: ConnState,
    stream_state: StreamState,
    query_state: QueryState,
    netto_deadline: i64,
    netdly_deadline: i64,
    keepalive_deadline: i64,

    recv_buf: Box<[u8]>,
    recv_len: usize,
    sid_pending: usize,
    packet: PacketInfo,
    tracked: bool,
    /// The transport reported EOF or an error; whole packets still in
    /// the receive buffer are framed before the link is torn down.
    eof_pending: bool,

    pub(crate) owned_buf: Vec<u8>,
}

impl SeedLinkConnection {
    /// Create a connection description with default configuration.
    ///
    /// No I/O happens until [`collect`](Self::collect) is first called.
    pub fn new(address: &str) -> Self {
        Self::with_config(address, ClientConfig::default())
    }

    pub fn with_config(address: &str, config: ClientConfig) -> Self {
        Self {
            address: address.to_owned(),
            config,
            streams: StreamRegistry::default(),
            auth: None,
            transport: None,
            server: None,
            protocol: ProtocolVersion::V3,
            batch_active: false,
            pending_info: None,
            terminate: TerminateHandle::new(),
            conn_state: ConnState::Down,
            stream_state: StreamState::Header,
            query_state: QueryState::Idle,
            netto_deadline: 0,
            netdly_deadline: 0,
            keepalive_deadline: 0,
            recv_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
            recv_len: 0,
            sid_pending: 0,
            packet: PacketInfo::empty(),
            tracked: false,
            eof_pending: false,
            owned_buf: Vec::new(),
        }
    }

    // -- Configuration (must not run concurrently with collect) --

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Install the supplier of v4 `AUTH` credentials.
    pub fn set_auth(&mut self, provider: impl AuthProvider + 'static) {
        self.auth = Some(Box::new(provider));
    }

    /// Subscribe to a station, optionally with selectors and a
    /// resumption point.
    pub fn add_stream(
        &mut self,
        station_id: &str,
        selectors: Option<&str>,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> Result<()> {
        self.streams.add(station_id, selectors, seqnum, timestamp)
    }

    /// Switch to all-station mode.
    pub fn set_all_station(
        &mut self,
        selectors: Option<&str>,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> Result<()> {
        self.streams.set_all_station(selectors, seqnum, timestamp)
    }

    /// Add subscriptions from a stream-list file
    /// (`NET_STA [selectors...]` per line).
    pub fn read_stream_list(&mut self, path: &str, default_selectors: Option<&str>) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.streams
            .add_from_streamlist_text(&text, default_selectors)
    }

    /// Add subscriptions from a `NET_STA[:selectors],...` string.
    pub fn parse_stream_list(&mut self, list: &str, default_selectors: Option<&str>) -> Result<usize> {
        self.streams.add_from_streamlist(list, default_selectors)
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Queue an `INFO` request; the response arrives as normal packets.
    ///
    /// Fails while another INFO or keepalive query is in flight.
    pub fn request_info(&mut self, level: InfoLevel) -> Result<()> {
        if self.pending_info.is_some() || self.query_state != QueryState::Idle {
            return Err(ClientError::InfoPending);
        }
        self.pending_info = Some(level);
        Ok(())
    }

    /// Handle for signalling termination from elsewhere.
    pub fn terminate_handle(&self) -> TerminateHandle {
        self.terminate.clone()
    }

    /// Request graceful termination.
    pub fn terminate(&self) {
        info!(peer = %self.address, "terminating connection");
        self.terminate.terminate();
    }

    // -- State persistence --

    /// Save per-station resumption state to `path`.
    pub fn save_state(&self, path: &str) -> Result<()> {
        statefile::save(&self.streams, path)
    }

    /// Recover per-station resumption state from `path`.
    ///
    /// A missing file is tolerated. Returns the number of records applied.
    pub fn recover_state(&mut self, path: &str) -> Result<usize> {
        statefile::recover(&mut self.streams, path)
    }

    // -- Introspection --

    /// Description of the connected server, once a greeting succeeded.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    /// The protocol in effect (V3 until a v4 upgrade succeeds).
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Whether the server activated batch mode during negotiation.
    pub fn batch_active(&self) -> bool {
        self.batch_active
    }

    /// Metadata of the packet being collected or last returned.
    pub fn packet_info(&self) -> &PacketInfo {
        &self.packet
    }

    // -- The driver --

    /// Drive the connection and collect the next packet into
    /// `payload_buffer`.
    ///
    /// Blocking mode waits until a packet arrives or the connection
    /// terminates; non-blocking mode returns [`Collect::NoPacket`] after
    /// a bounded poll. The buffer must hold at least 64 bytes for v3
    /// payload detection; see [`Collect::TooLarge`] for the
    /// buffer-growth contract.
    pub async fn collect(&mut self, payload_buffer: &mut [u8]) -> Collect {
        loop {
            if self.terminate.level() >= 2 {
                break;
            }
            if self.transport.is_none() {
                self.conn_state = ConnState::Down;
            }

            let now = now_ns();

            if self.conn_state == ConnState::Down {
                if self.terminate.level() >= 1 {
                    break;
                }
                if self.netdly_deadline != 0 && now < self.netdly_deadline {
                    tokio::time::sleep(RECONNECT_NAP).await;
                } else {
                    match self.open().await {
                        Ok(()) => {
                            self.conn_state = ConnState::Up;
                        }
                        Err(ClientError::BadAddress(address)) => {
                            error!(%address, "invalid server address, terminating");
                            self.terminate.escalate();
                            break;
                        }
                        Err(
                            e @ (ClientError::NegotiationFailed(_)
                            | ClientError::UnexpectedResponse(_)
                            | ClientError::Protocol(_)),
                        ) => {
                            error!(peer = %self.address, error = %e, "negotiation with server failed");
                            self.close();
                            self.clear_deadlines();
                            continue;
                        }
                        Err(e) => {
                            warn!(peer = %self.address, error = %e, "connection failed");
                            self.close();
                        }
                    }
                    self.clear_deadlines();
                }
            }

            if self.conn_state == ConnState::Up {
                if self.streams.is_empty() {
                    self.conn_state = ConnState::Streaming;
                } else {
                    let outcome = match (self.transport.as_mut(), self.server.as_ref()) {
                        (Some(transport), Some(server)) => {
                            negotiate::configure(
                                transport,
                                &self.config,
                                &self.streams,
                                server,
                                self.protocol,
                                &self.address,
                            )
                            .await
                        }
                        _ => Err(ClientError::Disconnected),
                    };
                    match outcome {
                        Ok(batch_active) => {
                            self.batch_active = batch_active;
                            self.conn_state = ConnState::Streaming;
                        }
                        Err(e) => {
                            error!(peer = %self.address, error = %e, "negotiation with server failed");
                            self.close();
                            self.clear_deadlines();
                            continue;
                        }
                    }
                }
            }

            if self.conn_state == ConnState::Streaming {
                // Send a queued INFO request when the line is free.
                if self.query_state == QueryState::Idle {
                    if let (Some(level), Some(transport)) =
                        (self.pending_info.take(), self.transport.as_mut())
                    {
                        let command = Command::Info { level };
                        match transport.send_command(&command, self.protocol).await {
                            Ok(()) => self.query_state = QueryState::InfoQuery,
                            Err(e) => {
                                // The read path will notice a dead socket.
                                warn!(peer = %self.address, error = %e, "INFO request failed");
                            }
                        }
                    }
                }

                let draining = self.terminate.level() >= 1;

                if let Some(transport) = self.transport.as_mut().filter(|_| {
                    !draining && !self.eof_pending && self.recv_len < RECV_BUFFER_LEN
                }) {
                    let window = if self.config.non_blocking {
                        NONBLOCKING_POLL
                    } else {
                        BLOCKING_POLL
                    };
                    let ready = self.recv_len > 0 || transport.poll_readable(window).await;
                    if ready {
                        match transport.recv_available(&mut self.recv_buf[self.recv_len..]) {
                            Ok(0) => {}
                            Ok(n) => {
                                self.recv_len += n;
                                // Traffic resets the idle and keepalive timers.
                                self.netto_deadline = 0;
                                self.keepalive_deadline = 0;
                            }
                            Err(e) => {
                                match e {
                                    ClientError::Disconnected => {
                                        info!(peer = %self.address, "server closed connection")
                                    }
                                    e => error!(peer = %self.address, error = %e, "receive failed"),
                                }
                                // Whole packets already buffered are still
                                // framed before the link is torn down.
                                self.eof_pending = true;
                            }
                        }
                    }
                }

                match self.frame(payload_buffer) {
                    Step::Packet => return Collect::Packet(self.packet.clone()),
                    Step::TooLarge => return Collect::TooLarge(self.packet.clone()),
                    Step::NeedMore => {
                        if self.eof_pending {
                            self.close();
                            self.netto_deadline = 0;
                            self.netdly_deadline = 0;
                        } else if draining {
                            self.terminate.escalate();
                            break;
                        }
                    }
                    Step::EndOfStream => {
                        // Dial-up completion: no automatic reconnect.
                        info!(peer = %self.address, "end of buffer or selected time window");
                        self.terminate.escalate();
                        self.close();
                        break;
                    }
                    Step::ServerError => {
                        error!(peer = %self.address, "server reported an error with the last command");
                        self.terminate.escalate();
                        self.close();
                        break;
                    }
                    Step::Corrupt(reason) => {
                        error!(peer = %self.address, %reason, "framing error, reconnecting");
                        self.close();
                        self.clear_deadlines();
                        continue;
                    }
                }
            }

            // Deadline bookkeeping.
            let now = now_ns();

            if self.conn_state == ConnState::Streaming {
                if let Some(netto) = self.config.network_timeout {
                    if self.netto_deadline != 0 && now >= self.netto_deadline {
                        info!(
                            peer = %self.address,
                            idle = ?netto,
                            delay = ?self.config.reconnect_delay,
                            "network timeout, reconnecting"
                        );
                        self.close();
                        self.netto_deadline = 0;
                        self.netdly_deadline = 0;
                    }
                }
            }

            if self.conn_state == ConnState::Streaming
                && self.query_state == QueryState::Idle
                && self.config.keepalive.is_some()
                && self.keepalive_deadline != 0
                && now >= self.keepalive_deadline
            {
                trace!(peer = %self.address, "sending keepalive probe");
                let command = Command::Info {
                    level: InfoLevel::Id,
                };
                let sent = match self.transport.as_mut() {
                    Some(transport) => transport.send_command(&command, self.protocol).await,
                    None => Err(ClientError::Disconnected),
                };
                match sent {
                    Ok(()) => {
                        self.query_state = QueryState::KeepAliveQuery;
                        self.keepalive_deadline = 0;
                    }
                    Err(e) => {
                        warn!(peer = %self.address, error = %e, "keepalive send failed");
                        self.close();
                        self.netto_deadline = 0;
                    }
                }
            }

            if let Some(netto) = self.config.network_timeout {
                if self.netto_deadline == 0 {
                    self.netto_deadline = now + duration_ns(netto);
                }
            }
            if !self.config.reconnect_delay.is_zero() && self.netdly_deadline == 0 {
                self.netdly_deadline = now + duration_ns(self.config.reconnect_delay);
            }
            if let Some(keepalive) = self.config.keepalive {
                if self.keepalive_deadline == 0 {
                    self.keepalive_deadline = now + duration_ns(keepalive);
                }
            }

            if self.config.non_blocking {
                return Collect::NoPacket;
            }
        }

        self.close();
        debug!(peer = %self.address, "collection terminated");
        Collect::Terminate
    }

    // -- Connection plumbing --

    async fn open(&mut self) -> Result<()> {
        let (host, port) = parse_address(&self.address)?;
        let mut transport = Transport::connect(
            &host,
            port,
            self.config.connect_timeout,
            self.config.io_timeout,
        )
        .await?;

        let (server, protocol) = negotiate::handshake(
            &mut transport,
            &self.config,
            self.auth.as_deref_mut(),
            &self.address,
        )
        .await?;

        self.server = Some(server);
        self.protocol = protocol;
        self.transport = Some(transport);
        Ok(())
    }

    fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!(peer = %self.address, "network socket closed");
        }
        self.conn_state = ConnState::Down;
        self.stream_state = StreamState::Header;
        self.query_state = QueryState::Idle;
        self.batch_active = false;
        self.recv_len = 0;
        self.sid_pending = 0;
        self.packet.reset();
        self.tracked = false;
        self.eof_pending = false;
    }

    fn clear_deadlines(&mut self) {
        self.netto_deadline = 0;
        self.netdly_deadline = 0;
        self.keepalive_deadline = 0;
    }

    /// Drop `n` consumed bytes from the head of the receive buffer.
    fn consume(&mut self, n: usize) {
        self.recv_buf.copy_within(n..self.recv_len, 0);
        self.recv_len -= n;
    }

    // -- Framer --

    /// Run the framer over the receive buffer until it produces a
    /// caller-visible outcome or needs more bytes.
    fn frame(&mut self, payload_buffer: &mut [u8]) -> Step {
        loop {
            match self.stream_state {
                StreamState::Header => {
                    // Unsolicited stream interruptions come as bare text.
                    if self.recv_len >= 5 && &self.recv_buf[..5] == b"ERROR" {
                        return Step::ServerError;
                    }
                    if self.recv_len >= 3 && &self.recv_buf[..3] == b"END" {
                        return Step::EndOfStream;
                    }

                    let need = match self.protocol {
                        ProtocolVersion::V3 => V3_HEADER_LEN,
                        ProtocolVersion::V4 => V4_HEADER_LEN,
                    };
                    if self.recv_len < need {
                        return Step::NeedMore;
                    }

                    let header = match self.protocol {
                        ProtocolVersion::V3 => FrameHeader::parse_v3(&self.recv_buf[..need]),
                        ProtocolVersion::V4 => FrameHeader::parse_v4(&self.recv_buf[..need]),
                    };
                    let header = match header {
                        Ok(header) => header,
                        Err(e) => return Step::Corrupt(e.to_string()),
                    };

                    self.packet.reset();
                    self.tracked = false;
                    self.sid_pending = 0;

                    match header {
                        FrameHeader::V3Data { seqnum } => {
                            self.packet.seqnum = seqnum;
                        }
                        FrameHeader::V3Info { terminated } => {
                            self.packet.payload_format = if terminated {
                                PayloadFormat::MSeed2InfoTerm
                            } else {
                                PayloadFormat::MSeed2Info
                            };
                        }
                        FrameHeader::V4 {
                            format,
                            subformat,
                            payload_length,
                            seqnum,
                            station_id_length,
                        } => {
                            self.packet.payload_format = format;
                            self.packet.payload_subformat = subformat;
                            self.packet.payload_length = payload_length;
                            self.packet.seqnum = seqnum;
                            self.sid_pending = station_id_length as usize;
                        }
                    }

                    self.consume(need);
                    self.stream_state = if self.sid_pending > 0 {
                        StreamState::StationId
                    } else {
                        StreamState::Payload
                    };
                }

                StreamState::StationId => {
                    if self.recv_len < self.sid_pending {
                        return Step::NeedMore;
                    }
                    self.packet.station_id =
                        String::from_utf8_lossy(&self.recv_buf[..self.sid_pending]).into_owned();
                    self.consume(self.sid_pending);
                    self.sid_pending = 0;
                    self.stream_state = StreamState::Payload;
                }

                StreamState::Payload => {
                    let step = match self.protocol {
                        ProtocolVersion::V3 => self.assemble_v3(payload_buffer),
                        ProtocolVersion::V4 => self.assemble_v4(payload_buffer),
                    };
                    match step {
                        PayloadStep::Complete { deliver } => {
                            self.stream_state = StreamState::Header;
                            if deliver {
                                return Step::Packet;
                            }
                            // Swallowed keepalive response; keep framing.
                        }
                        PayloadStep::NeedMore => return Step::NeedMore,
                        PayloadStep::TooLarge => return Step::TooLarge,
                        PayloadStep::Corrupt(reason) => return Step::Corrupt(reason),
                    }
                }
            }
        }
    }

    /// Assemble a v3 payload, inferring its length from the content.
    fn assemble_v3(&mut self, payload_buffer: &mut [u8]) -> PayloadStep {
        let mut collected = self.packet.payload_collected as usize;

        while self.packet.payload_length == 0 {
            if payload_buffer.len() < MIN_PAYLOAD {
                return PayloadStep::Corrupt(format!(
                    "payload buffer of {} bytes is below the {MIN_PAYLOAD}-byte detection minimum",
                    payload_buffer.len()
                ));
            }
            if collected == payload_buffer.len() {
                return PayloadStep::Corrupt(
                    "payload buffer exhausted before length was determined".into(),
                );
            }

            let take = DETECT_CHUNK
                .min(self.recv_len)
                .min(payload_buffer.len() - collected);
            if take == 0 {
                return PayloadStep::NeedMore;
            }
            payload_buffer[collected..collected + take].copy_from_slice(&self.recv_buf[..take]);
            self.consume(take);
            collected += take;
            self.packet.payload_collected = collected as u32;

            if collected < MIN_PAYLOAD {
                continue;
            }

            match inspect::detect(&payload_buffer[..collected]) {
                Err(e) => {
                    return PayloadStep::Corrupt(format!(
                        "non-miniSEED payload on a v3 connection: {e}"
                    ));
                }
                Ok(Detection::Incomplete { .. }) => {}
                Ok(Detection::Complete { format, length }) => {
                    if (length as usize) < MIN_PAYLOAD {
                        return PayloadStep::Corrupt(format!(
                            "detected record length {length} below the {MIN_PAYLOAD}-byte minimum"
                        ));
                    }
                    // INFO packets keep the format assigned by the header.
                    if self.packet.payload_format == PayloadFormat::Unknown {
                        self.packet.payload_format = format;
                    }
                    self.packet.payload_length = length;
                }
            }
        }

        let total = self.packet.payload_length as usize;
        if total > payload_buffer.len() {
            return PayloadStep::TooLarge;
        }

        if !self.tracked
            && collected >= MIN_PAYLOAD
            && !self
                .packet
                .payload_format
                .is_info_or_error(self.packet.payload_subformat)
        {
            self.tracked = true;
            self.track(payload_buffer, collected);
        }

        if collected < total {
            let take = (total - collected).min(self.recv_len);
            if take == 0 {
                return PayloadStep::NeedMore;
            }
            payload_buffer[collected..collected + take].copy_from_slice(&self.recv_buf[..take]);
            self.consume(take);
            collected += take;
            self.packet.payload_collected = collected as u32;
        }

        if collected < total {
            return PayloadStep::NeedMore;
        }

        match self.packet.payload_format {
            PayloadFormat::MSeed2InfoTerm => {
                let keepalive = self.query_state == QueryState::KeepAliveQuery;
                self.query_state = QueryState::Idle;
                if keepalive {
                    trace!(peer = %self.address, "keepalive acknowledged");
                    return PayloadStep::Complete { deliver: false };
                }
            }
            PayloadFormat::MSeed2Info => {
                if self.query_state == QueryState::KeepAliveQuery {
                    return PayloadStep::Complete { deliver: false };
                }
            }
            _ => {}
        }
        PayloadStep::Complete { deliver: true }
    }

    /// Assemble a v4 payload of known length.
    fn assemble_v4(&mut self, payload_buffer: &mut [u8]) -> PayloadStep {
        let total = self.packet.payload_length as usize;
        if total > payload_buffer.len() {
            return PayloadStep::TooLarge;
        }

        let mut collected = self.packet.payload_collected as usize;

        if collected < total {
            let take = (total - collected).min(self.recv_len);
            if take == 0 {
                return PayloadStep::NeedMore;
            }
            payload_buffer[collected..collected + take].copy_from_slice(&self.recv_buf[..take]);
            self.consume(take);
            collected += take;
            self.packet.payload_collected = collected as u32;

            if !self.tracked
                && collected >= MIN_PAYLOAD
                && !self
                    .packet
                    .payload_format
                    .is_info_or_error(self.packet.payload_subformat)
            {
                self.tracked = true;
                self.track(payload_buffer, collected);
            }
        }

        if collected < total {
            return PayloadStep::NeedMore;
        }

        if self.packet.payload_format == PayloadFormat::Json
            && self.packet.payload_subformat == SUBFORMAT_INFO
        {
            let keepalive = self.query_state == QueryState::KeepAliveQuery;
            self.query_state = QueryState::Idle;
            if keepalive {
                trace!(peer = %self.address, "keepalive acknowledged");
                return PayloadStep::Complete { deliver: false };
            }
        }
        PayloadStep::Complete { deliver: true }
    }

    /// Update per-station resumption state from a buffered data payload.
    ///
    /// The station id from the payload fills the packet metadata when
    /// the header carried none (v3). A packet matching no subscription
    /// is logged and still delivered.
    fn track(&mut self, payload_buffer: &[u8], collected: usize) {
        match inspect::record_ids(self.packet.payload_format, &payload_buffer[..collected]) {
            Ok(ids) => {
                if self.packet.station_id.is_empty() {
                    self.packet.station_id = ids.station_id.clone();
                }
                let updates = self.streams.update(
                    &self.packet.station_id,
                    self.packet.seqnum,
                    &ids.start_time,
                );
                if updates == 0 {
                    error!(
                        peer = %self.address,
                        station = %self.packet.station_id,
                        "unexpected data received"
                    );
                }
            }
            Err(e) => {
                debug!(peer = %self.address, error = %e, "cannot extract tracking ids");
            }
        }
    }
}

fn duration_ns(duration: Duration) -> i64 {
    duration.as_nanos() as i64
}

#[cfg(test)]
impl SeedLinkConnection {
    /// Inject bytes as if received from the network.
    pub(crate) fn test_feed(&mut self, bytes: &[u8]) {
        self.recv_buf[self.recv_len..self.recv_len + bytes.len()].copy_from_slice(bytes);
        self.recv_len += bytes.len();
    }

    /// Jump straight to the streaming state without a server.
    pub(crate) fn test_streaming(&mut self, protocol: ProtocolVersion) {
        self.protocol = protocol;
        self.conn_state = ConnState::Streaming;
    }

    pub(crate) fn test_frame(&mut self, payload_buffer: &mut [u8]) -> Option<Collect> {
        match self.frame(payload_buffer) {
            Step::Packet => Some(Collect::Packet(self.packet.clone())),
            Step::TooLarge => Some(Collect::TooLarge(self.packet.clone())),
            Step::NeedMore => None,
            Step::EndOfStream | Step::ServerError => Some(Collect::Terminate),
            Step::Corrupt(reason) => panic!("unexpected framing error: {reason}"),
        }
    }

    pub(crate) fn test_set_keepalive_query(&mut self) {
        self.query_state = QueryState::KeepAliveQuery;
    }

    pub(crate) fn test_query_idle(&self) -> bool {
        self.query_state == QueryState::Idle
    }

    pub(crate) fn test_streams_mut(&mut self) -> &mut StreamRegistry {
        &mut self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slink_protocol::frame::{build_v3_header, build_v4_packet};
    use slink_protocol::payload::SUBFORMAT_ERROR;

    fn mseed2_record(network: &str, station: &str) -> Vec<u8> {
        let mut rec = vec![0u8; 512];
        rec[..6].copy_from_slice(b"000001");
        rec[6] = b'D';
        rec[7] = b' ';
        for (i, b) in station.bytes().chain(std::iter::repeat(b' ')).take(5).enumerate() {
            rec[8 + i] = b;
        }
        rec[13] = b'0';
        rec[14] = b'0';
        rec[15] = b'B';
        rec[16] = b'H';
        rec[17] = b'Z';
        for (i, b) in network.bytes().chain(std::iter::repeat(b' ')).take(2).enumerate() {
            rec[18 + i] = b;
        }
        rec[20..22].copy_from_slice(&2023u16.to_ne_bytes());
        rec[22..24].copy_from_slice(&166u16.to_ne_bytes());
        rec[24] = 12;
        rec[46..48].copy_from_slice(&48u16.to_ne_bytes());
        rec[48..50].copy_from_slice(&1000u16.to_ne_bytes());
        rec[52] = 10;
        rec[53] = 1;
        rec[54] = 9;
        rec
    }

    fn v3_packet(seq: u64, network: &str, station: &str) -> Vec<u8> {
        let mut packet = build_v3_header(seq).to_vec();
        packet.extend_from_slice(&mseed2_record(network, station));
        packet
    }

    #[test]
    fn v4_packet_framing() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);

        let payload = vec![0xAB_u8; 256];
        let packet = build_v4_packet(
            PayloadFormat::MSeed3,
            0,
            SequenceNumber::new(42),
            "IU_ANMO",
            &payload,
        );
        conn.test_feed(&packet);

        let mut buffer = vec![0u8; 1024];
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.seqnum, SequenceNumber::new(42));
                assert_eq!(info.payload_length, 256);
                assert_eq!(info.payload_collected, 256);
                assert_eq!(info.station_id, "IU_ANMO");
                assert_eq!(info.payload_format, PayloadFormat::MSeed3);
            }
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(&buffer[..256], payload.as_slice());
    }

    #[test]
    fn v3_packet_framing_with_detection() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);
        conn.test_streams_mut()
            .add("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        conn.test_feed(&v3_packet(1, "IU", "ANMO"));

        let mut buffer = vec![0u8; 1024];
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.seqnum, SequenceNumber::new(1));
                assert_eq!(info.payload_length, 512);
                assert_eq!(info.station_id, "IU_ANMO");
                assert_eq!(info.payload_format, PayloadFormat::MSeed2);
            }
            other => panic!("expected packet, got {other:?}"),
        }

        // Tracking recorded the packet against the subscription.
        let entry = &conn.streams().entries()[0];
        assert_eq!(entry.seqnum, SequenceNumber::new(1));
        assert_eq!(entry.timestamp, "2023-06-15T12:00:00.0000Z");
    }

    /// Feeding a byte stream incrementally yields the same packets as
    /// feeding it at once.
    #[test]
    fn framer_is_incremental() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&v3_packet(1, "IU", "ANMO"));
        stream.extend_from_slice(&v3_packet(2, "IU", "ANMO"));
        stream.extend_from_slice(&v3_packet(3, "GE", "WLF"));

        let collect_all = |chunk: usize| -> Vec<(u64, String)> {
            let mut conn = SeedLinkConnection::new("test:18000");
            conn.test_streaming(ProtocolVersion::V3);
            let mut buffer = vec![0u8; 1024];
            let mut packets = Vec::new();
            for piece in stream.chunks(chunk) {
                conn.test_feed(piece);
                while let Some(Collect::Packet(info)) = conn.test_frame(&mut buffer) {
                    packets.push((info.seqnum.value(), info.station_id.clone()));
                }
            }
            packets
        };

        let whole = collect_all(stream.len());
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0], (1, "IU_ANMO".into()));
        assert_eq!(whole[2], (3, "GE_WLF".into()));

        for chunk in [1, 7, 64, 512] {
            assert_eq!(collect_all(chunk), whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn v4_too_large_preserves_progress() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);

        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let packet = build_v4_packet(
            PayloadFormat::MSeed3,
            0,
            SequenceNumber::new(9),
            "IU_ANMO",
            &payload,
        );
        conn.test_feed(&packet);

        let mut small = vec![0u8; 128];
        match conn.test_frame(&mut small).unwrap() {
            Collect::TooLarge(info) => {
                assert_eq!(info.payload_length, 300);
                assert_eq!(info.payload_collected, 0);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }

        // A second attempt with an adequate buffer succeeds in full.
        let mut big = vec![0u8; 512];
        match conn.test_frame(&mut big).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.payload_collected, 300);
            }
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(&big[..300], payload.as_slice());
    }

    #[test]
    fn v4_keepalive_info_is_swallowed() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);
        conn.test_set_keepalive_query();

        let info_packet = build_v4_packet(
            PayloadFormat::Json,
            SUBFORMAT_INFO,
            SequenceNumber::UNSET,
            "",
            br#"{"software":"test"}"#,
        );
        let data_packet = build_v4_packet(
            PayloadFormat::MSeed3,
            0,
            SequenceNumber::new(5),
            "IU_ANMO",
            &[0u8; 32],
        );
        conn.test_feed(&info_packet);
        conn.test_feed(&data_packet);

        let mut buffer = vec![0u8; 1024];
        // The INFO response is consumed internally; the framer proceeds
        // straight to the data packet.
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => assert_eq!(info.seqnum, SequenceNumber::new(5)),
            other => panic!("expected data packet, got {other:?}"),
        }
        assert!(conn.test_query_idle());
    }

    #[test]
    fn v4_requested_info_is_delivered() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);

        let info_packet = build_v4_packet(
            PayloadFormat::Json,
            SUBFORMAT_INFO,
            SequenceNumber::UNSET,
            "",
            br#"{"station_count":3}"#,
        );
        conn.test_feed(&info_packet);

        let mut buffer = vec![0u8; 1024];
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.payload_format, PayloadFormat::Json);
                assert_eq!(info.payload_subformat, SUBFORMAT_INFO);
            }
            other => panic!("expected INFO packet, got {other:?}"),
        }
    }

    #[test]
    fn v4_error_info_is_delivered() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);
        conn.test_set_keepalive_query();

        let error_packet = build_v4_packet(
            PayloadFormat::Json,
            SUBFORMAT_ERROR,
            SequenceNumber::UNSET,
            "",
            br#"{"error":"bad"}"#,
        );
        conn.test_feed(&error_packet);

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(
            conn.test_frame(&mut buffer).unwrap(),
            Collect::Packet(_)
        ));
    }

    #[test]
    fn v3_info_chunks() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);

        // Unterminated chunk then terminating chunk, both miniSEED 2.
        let mut stream = Vec::new();
        stream.extend_from_slice(&slink_protocol::frame::build_v3_info_header(false));
        stream.extend_from_slice(&mseed2_record("XX", "INFO"));
        stream.extend_from_slice(&slink_protocol::frame::build_v3_info_header(true));
        stream.extend_from_slice(&mseed2_record("XX", "INFO"));
        conn.test_feed(&stream);

        let mut buffer = vec![0u8; 1024];
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.payload_format, PayloadFormat::MSeed2Info);
                assert_eq!(info.seqnum, SequenceNumber::UNSET);
            }
            other => panic!("expected INFO chunk, got {other:?}"),
        }
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => {
                assert_eq!(info.payload_format, PayloadFormat::MSeed2InfoTerm);
            }
            other => panic!("expected terminating INFO chunk, got {other:?}"),
        }
    }

    #[test]
    fn v3_keepalive_info_is_swallowed() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);
        conn.test_set_keepalive_query();

        let mut stream = Vec::new();
        stream.extend_from_slice(&slink_protocol::frame::build_v3_info_header(true));
        stream.extend_from_slice(&mseed2_record("XX", "INFO"));
        stream.extend_from_slice(&v3_packet(7, "IU", "ANMO"));
        conn.test_feed(&stream);

        let mut buffer = vec![0u8; 1024];
        match conn.test_frame(&mut buffer).unwrap() {
            Collect::Packet(info) => assert_eq!(info.seqnum, SequenceNumber::new(7)),
            other => panic!("expected data packet, got {other:?}"),
        }
        assert!(conn.test_query_idle());
    }

    #[test]
    fn server_end_terminates() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);
        conn.test_feed(b"END\r");

        let mut buffer = vec![0u8; 256];
        assert!(matches!(
            conn.test_frame(&mut buffer).unwrap(),
            Collect::Terminate
        ));
    }

    #[test]
    fn server_error_terminates() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V4);
        conn.test_feed(b"ERROR\r\n");

        let mut buffer = vec![0u8; 256];
        assert!(matches!(
            conn.test_frame(&mut buffer).unwrap(),
            Collect::Terminate
        ));
    }

    #[test]
    #[should_panic(expected = "framing error")]
    fn v3_garbage_payload_is_fatal() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);

        let mut stream = build_v3_header(0x10).to_vec();
        stream.extend_from_slice(&[0x55u8; 128]);
        conn.test_feed(&stream);

        let mut buffer = vec![0u8; 1024];
        conn.test_frame(&mut buffer);
    }

    #[test]
    #[should_panic(expected = "framing error")]
    fn bad_signature_is_fatal() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);
        conn.test_feed(b"XX123456");

        let mut buffer = vec![0u8; 256];
        conn.test_frame(&mut buffer);
    }

    #[test]
    fn wildcard_subscription_tracks_by_payload_id() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.test_streaming(ProtocolVersion::V3);
        conn.test_streams_mut()
            .add("IU_*", None, SequenceNumber::UNSET, None)
            .unwrap();
        conn.test_streams_mut()
            .add("GE_*", None, SequenceNumber::UNSET, None)
            .unwrap();

        conn.test_feed(&v3_packet(21, "IU", "ANMO"));
        let mut buffer = vec![0u8; 1024];
        assert!(matches!(
            conn.test_frame(&mut buffer).unwrap(),
            Collect::Packet(_)
        ));

        let entries = conn.streams().entries();
        let iu = entries.iter().find(|e| e.station_id == "IU_*").unwrap();
        let ge = entries.iter().find(|e| e.station_id == "GE_*").unwrap();
        assert_eq!(iu.seqnum, SequenceNumber::new(21));
        assert!(ge.seqnum.is_unset());
    }

    #[test]
    fn request_info_blocks_while_pending() {
        let mut conn = SeedLinkConnection::new("test:18000");
        conn.request_info(InfoLevel::Id).unwrap();
        assert!(matches!(
            conn.request_info(InfoLevel::Streams),
            Err(ClientError::InfoPending)
        ));
    }

    #[test]
    fn terminate_handle_levels() {
        let handle = TerminateHandle::new();
        assert!(!handle.is_terminated());
        handle.terminate();
        assert!(handle.is_terminated());
        assert_eq!(handle.level(), 1);
        handle.escalate();
        assert_eq!(handle.level(), 2);
        // terminate() never downgrades an escalation.
        handle.terminate();
        assert_eq!(handle.level(), 2);
    }
}
