use crate::error::{ProtocolError, Result};
use crate::version::ProtocolVersion;

/// Detail level of an `INFO` request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InfoLevel {
    Id,
    Stations,
    Streams,
    Connections,
    /// v3 only.
    Gaps,
    /// v3 only.
    All,
    /// v4 only.
    Formats,
    /// v4 only.
    Capabilities,
}

impl InfoLevel {
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_uppercase().as_str() {
            "ID" => Ok(Self::Id),
            "STATIONS" => Ok(Self::Stations),
            "STREAMS" => Ok(Self::Streams),
            "CONNECTIONS" => Ok(Self::Connections),
            "GAPS" => Ok(Self::Gaps),
            "ALL" => Ok(Self::All),
            "FORMATS" => Ok(Self::Formats),
            "CAPABILITIES" => Ok(Self::Capabilities),
            other => Err(ProtocolError::InvalidCommand(format!(
                "unknown INFO level {other:?}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Stations => "STATIONS",
            Self::Streams => "STREAMS",
            Self::Connections => "CONNECTIONS",
            Self::Gaps => "GAPS",
            Self::All => "ALL",
            Self::Formats => "FORMATS",
            Self::Capabilities => "CAPABILITIES",
        }
    }

    pub fn is_valid_for(self, version: ProtocolVersion) -> bool {
        match self {
            Self::Id | Self::Stations | Self::Streams | Self::Connections => true,
            Self::Gaps | Self::All => version == ProtocolVersion::V3,
            Self::Formats | Self::Capabilities => version == ProtocolVersion::V4,
        }
    }
}

impl std::fmt::Display for InfoLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
