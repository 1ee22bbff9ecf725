//! Connection negotiation: greeting, protocol upgrade, identification,
//! and the three data-selection dialects.

use slink_protocol::response::{parse_version, Hello, Response};
use slink_protocol::{Command, ProtocolVersion, SequenceNumber};
use slink_protocol::timeutil;
use tracing::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::config::ClientConfig;
use crate::connection::{Transport, MAX_RESPONSE};
use crate::error::{ClientError, Result};
use crate::streams::{StreamEntry, StreamRegistry, ALL_STATION_ID};

/// What the server told us about itself during the greeting.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// Server software identifier from the first `HELLO` line.
    pub software: String,
    /// Organization line.
    pub organization: String,
    /// Parsed server version; `(0, 0)` when unknown.
    pub major: u8,
    pub minor: u8,
    /// Capability flags from the greeting and `GETCAPABILITIES`.
    pub capabilities: Vec<String>,
    /// Extended replies were negotiated.
    pub extreply: bool,
}

impl ServerInfo {
    pub fn at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    pub fn has_capability(&self, flag: &str) -> bool {
        self.capabilities.iter().any(|c| c == flag)
    }
}

async fn read_reply(transport: &mut Transport) -> Result<Response> {
    let line = transport.recv_response(MAX_RESPONSE).await?;
    Ok(Response::parse(&line)?)
}

/// Greeting, protocol upgrade, and client identification.
///
/// Returns the server description and the protocol to speak from here
/// on. Rejections are [`ClientError::NegotiationFailed`], which callers
/// treat as a disconnect-and-retry-immediately condition.
pub(crate) async fn handshake<A: AuthProvider + ?Sized>(
    transport: &mut Transport,
    config: &ClientConfig,
    auth: Option<&mut A>,
    peer: &str,
) -> Result<(ServerInfo, ProtocolVersion)> {
    transport
        .send_command(&Command::Hello, ProtocolVersion::V3)
        .await?;
    let line1 = transport.recv_response(MAX_RESPONSE).await?;
    let line2 = transport.recv_response(MAX_RESPONSE).await?;
    let hello = Hello::parse(&line1, &line2);

    info!(peer, server = %line1.trim_end(), "connected");
    info!(peer, organization = %hello.organization);

    let mut server = ServerInfo {
        software: hello.software.clone(),
        organization: hello.organization.clone(),
        major: hello.major,
        minor: hello.minor,
        capabilities: hello.capabilities.clone(),
        extreply: false,
    };
    let mut protocol = ProtocolVersion::V3;

    if config.prefer_v4 && hello.major >= 4 {
        let (max_major, max_minor) = ProtocolVersion::MAX_SUPPORTED;
        transport
            .send_command(
                &Command::SlProto {
                    major: max_major,
                    minor: max_minor,
                },
                ProtocolVersion::V4,
            )
            .await?;
        match read_reply(transport).await? {
            Response::Ok => {
                protocol = ProtocolVersion::V4;
                debug!(peer, "upgraded to protocol {max_major}.{max_minor}");
            }
            Response::Error { description, .. } => {
                return Err(ClientError::NegotiationFailed(format!(
                    "SLPROTO rejected: {description}"
                )));
            }
            Response::End => {
                return Err(ClientError::UnexpectedResponse(
                    "END in reply to SLPROTO".into(),
                ));
            }
        }

        // The full capability set is only available after the upgrade.
        transport
            .send_command(&Command::GetCapabilities, ProtocolVersion::V4)
            .await?;
        let caps_line = transport.recv_response(MAX_RESPONSE).await?;
        if let Ok(Response::Error { description, .. }) = Response::parse(&caps_line) {
            return Err(ClientError::NegotiationFailed(format!(
                "GETCAPABILITIES rejected: {description}"
            )));
        }
        let mut effective = (server.major, server.minor);
        for flag in caps_line.split_whitespace() {
            let flag = flag.trim_end_matches(['\r', '\n']);
            if flag.is_empty() {
                continue;
            }
            if let Some(version) = flag.strip_prefix("SLPROTO:").and_then(parse_version) {
                if version > effective && version <= ProtocolVersion::MAX_SUPPORTED {
                    effective = version;
                }
            }
            if !server.capabilities.iter().any(|c| c == flag) {
                server.capabilities.push(flag.to_owned());
            }
        }
        (server.major, server.minor) = effective;
        server.extreply = true;
    } else if server.has_capability("CAP") {
        // v3 capability announcement; extended replies when accepted.
        transport
            .send_command(
                &Command::Capabilities {
                    flags: "SLPROTO:3.1 EXTREPLY".to_owned(),
                },
                ProtocolVersion::V3,
            )
            .await?;
        match read_reply(transport).await? {
            Response::Ok => server.extreply = true,
            Response::Error { .. } => {
                debug!(peer, "server declined capability announcement");
            }
            Response::End => {
                return Err(ClientError::UnexpectedResponse(
                    "END in reply to CAPABILITIES".into(),
                ));
            }
        }
    }

    if protocol == ProtocolVersion::V4 {
        let description = match (&config.client_name, &config.client_version) {
            (Some(name), Some(version)) => {
                format!("{name}/{version} {}", slink_protocol::LIBRARY_IDENT)
            }
            (Some(name), None) => format!("{name} {}", slink_protocol::LIBRARY_IDENT),
            _ => slink_protocol::LIBRARY_IDENT.to_owned(),
        };
        transport
            .send_command(&Command::UserAgent { description }, ProtocolVersion::V4)
            .await?;
        match read_reply(transport).await? {
            Response::Ok => {}
            Response::Error { description, .. } => {
                return Err(ClientError::NegotiationFailed(format!(
                    "USERAGENT rejected: {description}"
                )));
            }
            Response::End => {
                return Err(ClientError::UnexpectedResponse(
                    "END in reply to USERAGENT".into(),
                ));
            }
        }

        if let Some(provider) = auth {
            if let Some(value) = provider.auth_value(peer) {
                transport
                    .send_command(&Command::Auth { value }, ProtocolVersion::V4)
                    .await?;
                let reply = read_reply(transport).await;
                provider.auth_finish(peer);
                match reply? {
                    Response::Ok => {}
                    Response::Error { description, .. } => {
                        return Err(ClientError::NegotiationFailed(format!(
                            "AUTH rejected: {description}"
                        )));
                    }
                    Response::End => {
                        return Err(ClientError::UnexpectedResponse(
                            "END in reply to AUTH".into(),
                        ));
                    }
                }
            }
        }
    }

    Ok((server, protocol))
}

/// Configure data selection. Returns whether batch mode was activated.
pub(crate) async fn configure(
    transport: &mut Transport,
    config: &ClientConfig,
    registry: &StreamRegistry,
    server: &ServerInfo,
    protocol: ProtocolVersion,
    peer: &str,
) -> Result<bool> {
    match protocol {
        ProtocolVersion::V4 => {
            configure_v4(transport, config, registry, peer).await?;
            Ok(false)
        }
        ProtocolVersion::V3 if registry.is_all_station() => {
            configure_v3_uni(transport, config, registry, server, peer).await?;
            Ok(false)
        }
        ProtocolVersion::V3 => {
            configure_v3_multi(transport, config, registry, server, peer).await
        }
    }
}

/// The `DATA`/`FETCH`/`TIME` action for a v3 subscription.
fn v3_action(config: &ClientConfig, server: &ServerInfo, entry: &StreamEntry) -> Command {
    if let Some(begin) = &config.begin_time {
        if server.at_least(2, 92) {
            let start = timeutil::to_comma_datetime(begin).unwrap_or_else(|| begin.clone());
            let end = config
                .end_time
                .as_ref()
                .map(|t| timeutil::to_comma_datetime(t).unwrap_or_else(|| t.clone()));
            return Command::Time { start, end };
        }
        warn!(
            "server {}.{} does not support TIME windows",
            server.major, server.minor
        );
    }

    let sequence = (config.resume && !entry.seqnum.is_unset()).then(|| entry.seqnum.next());
    let start = sequence
        .is_some()
        .then(|| {
            (config.last_packet_time && server.at_least(2, 93) && !entry.timestamp.is_empty())
                .then(|| timeutil::to_comma_datetime(&entry.timestamp))
                .flatten()
        })
        .flatten();

    if config.dialup {
        Command::Fetch {
            sequence,
            start,
            end: None,
        }
    } else {
        Command::Data {
            sequence,
            start,
            end: None,
        }
    }
}

async fn configure_v3_uni(
    transport: &mut Transport,
    config: &ClientConfig,
    registry: &StreamRegistry,
    server: &ServerInfo,
    peer: &str,
) -> Result<()> {
    let entry = &registry.entries()[0];
    let mut rejected = 0usize;

    if let Some(selectors) = &entry.selectors {
        for selector in selectors.split_whitespace() {
            transport
                .send_command(
                    &Command::Select {
                        selector: selector.to_owned(),
                    },
                    ProtocolVersion::V3,
                )
                .await?;
            match read_reply(transport).await? {
                Response::Ok => debug!(peer, selector, "selector accepted"),
                Response::Error { description, .. } => {
                    rejected += 1;
                    error!(peer, selector, %description, "selector rejected");
                }
                Response::End => {
                    return Err(ClientError::UnexpectedResponse(
                        "END in reply to SELECT".into(),
                    ));
                }
            }
        }
    }

    if rejected > 0 {
        return Err(ClientError::NegotiationFailed(format!(
            "{rejected} selector(s) rejected"
        )));
    }

    // The action command gets no reply in uni-station mode; packets
    // follow immediately.
    let action = v3_action(config, server, entry);
    log_action(peer, &entry.station_id, &action);
    transport.send_command(&action, ProtocolVersion::V3).await?;
    Ok(())
}

async fn configure_v3_multi(
    transport: &mut Transport,
    config: &ClientConfig,
    registry: &StreamRegistry,
    server: &ServerInfo,
    peer: &str,
) -> Result<bool> {
    if !server.at_least(2, 5) {
        return Err(ClientError::NegotiationFailed(format!(
            "server {}.{} does not support multi-station mode",
            server.major, server.minor
        )));
    }

    let mut batch_active = false;
    if config.batch && server.at_least(3, 1) {
        transport
            .send_command(&Command::Batch, ProtocolVersion::V3)
            .await?;
        match read_reply(transport).await? {
            Response::Ok => {
                batch_active = true;
                debug!(peer, "batch mode activated");
            }
            Response::Error { .. } => debug!(peer, "batch mode declined"),
            Response::End => {
                return Err(ClientError::UnexpectedResponse(
                    "END in reply to BATCH".into(),
                ));
            }
        }
    }

    let mut rejected = 0usize;

    'entries: for entry in registry.entries() {
        transport
            .send_command(
                &Command::Station {
                    station_id: entry.station_id.clone(),
                },
                ProtocolVersion::V3,
            )
            .await?;
        if !batch_active {
            match read_reply(transport).await? {
                Response::Ok => {}
                Response::Error { description, .. } => {
                    rejected += 1;
                    error!(peer, station = %entry.station_id, %description, "station rejected");
                    continue 'entries;
                }
                Response::End => {
                    return Err(ClientError::UnexpectedResponse(
                        "END in reply to STATION".into(),
                    ));
                }
            }
        }

        if let Some(selectors) = &entry.selectors {
            for selector in selectors.split_whitespace() {
                transport
                    .send_command(
                        &Command::Select {
                            selector: selector.to_owned(),
                        },
                        ProtocolVersion::V3,
                    )
                    .await?;
                if !batch_active {
                    match read_reply(transport).await? {
                        Response::Ok => {}
                        Response::Error { description, .. } => {
                            rejected += 1;
                            error!(peer, selector, %description, "selector rejected");
                        }
                        Response::End => {
                            return Err(ClientError::UnexpectedResponse(
                                "END in reply to SELECT".into(),
                            ));
                        }
                    }
                }
            }
        }

        let action = v3_action(config, server, entry);
        log_action(peer, &entry.station_id, &action);
        transport.send_command(&action, ProtocolVersion::V3).await?;
        if !batch_active {
            match read_reply(transport).await? {
                Response::Ok => {}
                Response::Error { description, .. } => {
                    rejected += 1;
                    error!(peer, station = %entry.station_id, %description, "request rejected");
                }
                Response::End => {
                    return Err(ClientError::UnexpectedResponse(
                        "END in reply to DATA/FETCH/TIME".into(),
                    ));
                }
            }
        }
    }

    if rejected > 0 {
        return Err(ClientError::NegotiationFailed(format!(
            "{rejected} command(s) rejected"
        )));
    }

    transport
        .send_command(&Command::End, ProtocolVersion::V3)
        .await?;
    Ok(batch_active)
}

async fn configure_v4(
    transport: &mut Transport,
    config: &ClientConfig,
    registry: &StreamRegistry,
    peer: &str,
) -> Result<()> {
    let begin = config
        .begin_time
        .as_ref()
        .map(|t| timeutil::to_iso_datetime(t).unwrap_or_else(|| t.clone()));
    let end = config
        .end_time
        .as_ref()
        .map(|t| timeutil::to_iso_datetime(t).unwrap_or_else(|| t.clone()));

    let mut commands: Vec<Command> = Vec::new();
    for entry in registry.entries() {
        // All-station mode maps to a full wildcard subscription.
        let station_id = if entry.station_id == ALL_STATION_ID {
            "*".to_owned()
        } else {
            entry.station_id.clone()
        };
        commands.push(Command::Station { station_id });

        if let Some(selectors) = &entry.selectors {
            for selector in selectors.split_whitespace() {
                commands.push(Command::Select {
                    selector: selector.to_owned(),
                });
            }
        }

        let sequence: Option<SequenceNumber> =
            (config.resume && !entry.seqnum.is_unset()).then(|| entry.seqnum.next());
        let action = if config.dialup {
            Command::Fetch {
                sequence,
                start: begin.clone(),
                end: end.clone(),
            }
        } else {
            Command::Data {
                sequence,
                start: begin.clone(),
                end: end.clone(),
            }
        };
        log_action(peer, &entry.station_id, &action);
        commands.push(action);
    }

    // Send the whole batch, then collect one reply per command.
    for command in &commands {
        transport.send_command(command, ProtocolVersion::V4).await?;
    }

    let mut rejected = 0usize;
    for command in &commands {
        match read_reply(transport).await? {
            Response::Ok => {}
            Response::Error { description, .. } => {
                rejected += 1;
                error!(peer, command = command.name(), %description, "command rejected");
            }
            Response::End => {
                return Err(ClientError::UnexpectedResponse(format!(
                    "END in reply to {}",
                    command.name()
                )));
            }
        }
    }

    if rejected > 0 {
        return Err(ClientError::NegotiationFailed(format!(
            "{rejected} command(s) rejected"
        )));
    }

    transport
        .send_command(&Command::End, ProtocolVersion::V4)
        .await?;
    Ok(())
}

fn log_action(peer: &str, station_id: &str, action: &Command) {
    match action {
        Command::Data { sequence: Some(seq), .. } | Command::Fetch { sequence: Some(seq), .. } => {
            info!(peer, station_id, sequence = %seq, "resuming data");
        }
        Command::Time { start, .. } => {
            info!(peer, station_id, start = %start, "requesting time window");
        }
        _ => {
            info!(peer, station_id, "requesting next available data");
        }
    }
}

/// Connect, exchange `HELLO`, and disconnect.
///
/// Returns the raw server identification and organization lines.
pub async fn ping(address: &str, config: &ClientConfig) -> Result<(String, String)> {
    let (host, port) = crate::connection::parse_address(address)?;
    let mut transport =
        Transport::connect(&host, port, config.connect_timeout, config.io_timeout).await?;
    transport
        .send_command(&Command::Hello, ProtocolVersion::V3)
        .await?;
    let line1 = transport.recv_response(MAX_RESPONSE).await?;
    let line2 = transport.recv_response(MAX_RESPONSE).await?;
    Ok((
        line1.trim_end_matches(['\r', '\n']).to_owned(),
        line2.trim_end_matches(['\r', '\n']).to_owned(),
    ))
}
