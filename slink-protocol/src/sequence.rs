use crate::error::{ProtocolError, Result};

/// SeedLink packet sequence number.
///
/// v3 carries sequence numbers as 6 uppercase hex digits in packet headers
/// and accepts up to 16 hex digits in resume commands; v4 uses a
/// little-endian `u64` in headers and decimal text in commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Sentinel for "unknown or absent" sequence numbers.
    pub const UNSET: Self = Self(u64::MAX);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }

    /// The value to request when resuming after this packet.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Parse the 6-hex-digit form found in v3 packet headers.
    pub fn from_v3_header(hex: &str) -> Result<Self> {
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidSequence(format!(
                "expected 6 hex digits, got {hex:?}"
            )));
        }
        let value = u64::from_str_radix(hex, 16)
            .map_err(|_| ProtocolError::InvalidSequence(hex.to_owned()))?;
        Ok(Self(value))
    }

    /// 16-hex-digit uppercase form used in v3 resume commands.
    pub fn to_v3_resume(self) -> String {
        format!("{:016X}", self.0)
    }

    /// Decimal form used in v4 commands.
    pub fn to_v4_decimal(self) -> String {
        self.0.to_string()
    }

    /// Read the little-endian form found in v4 packet headers.
    pub fn from_v4_header(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub fn to_v4_header(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unset() {
            f.write_str("UNSET")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
