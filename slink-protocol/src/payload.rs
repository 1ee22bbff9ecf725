use crate::error::{ProtocolError, Result};

/// Subformat byte marking a JSON INFO response.
pub const SUBFORMAT_INFO: u8 = b'I';
/// Subformat byte marking a JSON ERROR response.
pub const SUBFORMAT_ERROR: u8 = b'E';

/// Payload kind of a SeedLink packet.
///
/// The first three variants never appear on the wire: `Unknown` is the
/// initial state of a v3 data packet before inspection, and the two INFO
/// variants are synthesized from the `SLINFO` header continuation flag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PayloadFormat {
    Unknown,
    /// v3 INFO chunk, more chunks follow.
    MSeed2Info,
    /// v3 INFO chunk, terminating.
    MSeed2InfoTerm,
    MSeed2,
    MSeed3,
    Json,
    Xml,
}

impl PayloadFormat {
    /// Parse a v4 header format byte.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            b'2' => Ok(Self::MSeed2),
            b'3' => Ok(Self::MSeed3),
            b'J' => Ok(Self::Json),
            b'X' => Ok(Self::Xml),
            other => Err(ProtocolError::InvalidPayloadFormat(other)),
        }
    }

    /// Single-byte code, matching the wire byte for wire-visible formats.
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::MSeed2Info => 1,
            Self::MSeed2InfoTerm => 2,
            Self::MSeed2 => b'2',
            Self::MSeed3 => b'3',
            Self::Json => b'J',
            Self::Xml => b'X',
        }
    }

    /// True for INFO and error payloads, which never update stream tracking.
    pub fn is_info_or_error(self, subformat: u8) -> bool {
        match self {
            Self::MSeed2Info | Self::MSeed2InfoTerm => true,
            Self::Json => subformat == SUBFORMAT_INFO || subformat == SUBFORMAT_ERROR,
            _ => false,
        }
    }
}

/// Human-readable description of a payload format and subformat pair.
pub fn format_description(format: PayloadFormat, subformat: u8) -> &'static str {
    match format {
        PayloadFormat::Unknown => "unknown",
        PayloadFormat::MSeed2Info => "INFO as XML in miniSEED 2",
        PayloadFormat::MSeed2InfoTerm => "INFO (terminated) as XML in miniSEED 2",
        PayloadFormat::MSeed2 => match subformat {
            b'E' => "miniSEED 2 event detection",
            b'C' => "miniSEED 2 calibration",
            b'T' => "miniSEED 2 timing exception",
            b'L' => "miniSEED 2 log",
            b'O' => "miniSEED 2 opaque",
            _ => "miniSEED 2",
        },
        PayloadFormat::MSeed3 => "miniSEED 3",
        PayloadFormat::Json => match subformat {
            SUBFORMAT_INFO => "INFO in JSON",
            SUBFORMAT_ERROR => "ERROR in JSON",
            _ => "JSON",
        },
        PayloadFormat::Xml => "XML",
    }
}
