use crate::error::{ProtocolError, Result};
use crate::info::InfoLevel;
use crate::sequence::SequenceNumber;
use crate::version::ProtocolVersion;

/// A client-to-server SeedLink command.
///
/// Commands serialize to CR-terminated ASCII lines. Several commands have
/// version-specific wire forms (`STATION`, resume arguments of
/// `DATA`/`FETCH`); [`Command::to_wire`] renders the form for the
/// negotiated protocol and rejects commands the protocol does not know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Hello,
    /// v3 capability announcement, e.g. `CAPABILITIES SLPROTO:3.1 EXTREPLY`.
    Capabilities { flags: String },
    /// v4 protocol upgrade request.
    SlProto { major: u8, minor: u8 },
    /// v4 full capability query.
    GetCapabilities,
    /// v4 client identification: `USERAGENT <client>[/<ver>] <library>/<ver>`.
    UserAgent { description: String },
    /// v4 authentication token.
    Auth { value: String },
    /// v3 request to suppress per-command responses.
    Batch,
    /// Station subscription: v3 `STATION <sta> <net>`, v4 `STATION <net>_<sta>`.
    Station { station_id: String },
    Select { selector: String },
    Data {
        sequence: Option<SequenceNumber>,
        start: Option<String>,
        end: Option<String>,
    },
    Fetch {
        sequence: Option<SequenceNumber>,
        start: Option<String>,
        end: Option<String>,
    },
    /// v3 time window request.
    Time { start: String, end: Option<String> },
    Info { level: InfoLevel },
    End,
    Bye,
}

impl Command {
    /// Serialize to wire bytes (CR-terminated) for the given protocol.
    pub fn to_wire(&self, version: ProtocolVersion) -> Result<Vec<u8>> {
        if !self.is_valid_for(version) {
            return Err(ProtocolError::VersionMismatch {
                command: self.name(),
                version,
            });
        }
        let mut line = self.format_line(version);
        line.push('\r');
        Ok(line.into_bytes())
    }

    /// Whether this command exists in the given protocol generation.
    pub fn is_valid_for(&self, version: ProtocolVersion) -> bool {
        match self {
            Self::Hello
            | Self::Station { .. }
            | Self::Select { .. }
            | Self::Data { .. }
            | Self::Fetch { .. }
            | Self::Info { .. }
            | Self::End
            | Self::Bye => true,
            Self::Capabilities { .. } | Self::Batch | Self::Time { .. } => {
                version == ProtocolVersion::V3
            }
            Self::SlProto { .. }
            | Self::GetCapabilities
            | Self::UserAgent { .. }
            | Self::Auth { .. } => version == ProtocolVersion::V4,
        }
    }

    /// Command keyword, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Capabilities { .. } => "CAPABILITIES",
            Self::SlProto { .. } => "SLPROTO",
            Self::GetCapabilities => "GETCAPABILITIES",
            Self::UserAgent { .. } => "USERAGENT",
            Self::Auth { .. } => "AUTH",
            Self::Batch => "BATCH",
            Self::Station { .. } => "STATION",
            Self::Select { .. } => "SELECT",
            Self::Data { .. } => "DATA",
            Self::Fetch { .. } => "FETCH",
            Self::Time { .. } => "TIME",
            Self::Info { .. } => "INFO",
            Self::End => "END",
            Self::Bye => "BYE",
        }
    }

    fn format_line(&self, version: ProtocolVersion) -> String {
        match self {
            Self::Hello => "HELLO".into(),
            Self::Capabilities { flags } => format!("CAPABILITIES {flags}"),
            Self::SlProto { major, minor } => format!("SLPROTO {major}.{minor}"),
            Self::GetCapabilities => "GETCAPABILITIES".into(),
            Self::UserAgent { description } => format!("USERAGENT {description}"),
            Self::Auth { value } => format!("AUTH {value}"),
            Self::Batch => "BATCH".into(),
            Self::Station { station_id } => match version {
                ProtocolVersion::V3 => {
                    let (net, sta) = station_id.split_once('_').unwrap_or(("", station_id));
                    format!("STATION {sta} {net}")
                }
                ProtocolVersion::V4 => format!("STATION {station_id}"),
            },
            Self::Select { selector } => format!("SELECT {selector}"),
            Self::Data {
                sequence,
                start,
                end,
            } => format_action("DATA", version, *sequence, start.as_deref(), end.as_deref()),
            Self::Fetch {
                sequence,
                start,
                end,
            } => format_action("FETCH", version, *sequence, start.as_deref(), end.as_deref()),
            Self::Time { start, end } => match end {
                Some(end) => format!("TIME {start} {end}"),
                None => format!("TIME {start}"),
            },
            Self::Info { level } => format!("INFO {}", level.as_str()),
            Self::End => "END".into(),
            Self::Bye => "BYE".into(),
        }
    }
}

/// Render a `DATA`/`FETCH` line with optional resume and window arguments.
///
/// v3 carries the resume sequence as 16 uppercase hex digits, optionally
/// followed by the last-packet time; time windows use the separate `TIME`
/// command. v4 carries a decimal sequence with the window attached, and
/// the literal `-1` selects all data from the window start when no
/// sequence is available.
fn format_action(
    keyword: &str,
    version: ProtocolVersion,
    sequence: Option<SequenceNumber>,
    start: Option<&str>,
    end: Option<&str>,
) -> String {
    let mut line = keyword.to_owned();
    match version {
        ProtocolVersion::V3 => {
            if let Some(seq) = sequence {
                line.push(' ');
                line.push_str(&seq.to_v3_resume());
                if let Some(start) = start {
                    line.push(' ');
                    line.push_str(start);
                }
            }
        }
        ProtocolVersion::V4 => {
            match (sequence, start) {
                (Some(seq), _) => {
                    line.push(' ');
                    line.push_str(&seq.to_v4_decimal());
                }
                (None, Some(_)) => line.push_str(" -1"),
                (None, None) => {}
            }
            if let Some(start) = start {
                line.push(' ');
                line.push_str(start);
                if let Some(end) = end {
                    line.push(' ');
                    line.push_str(end);
                }
            }
        }
    }
    line
}
