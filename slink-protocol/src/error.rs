use crate::version::ProtocolVersion;

/// Errors produced while parsing or serializing SeedLink wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer too short: expected {expected} bytes, have {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unexpected header signature: {0:?}")]
    InvalidSignature([u8; 2]),

    #[error("invalid sequence number: {0}")]
    InvalidSequence(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("{command} is not valid for protocol {version}")]
    VersionMismatch {
        command: &'static str,
        version: ProtocolVersion,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid payload format byte: 0x{0:02x}")]
    InvalidPayloadFormat(u8),

    #[error("station id length {0} exceeds maximum")]
    StationIdTooLong(usize),

    #[error("payload is not a recognized miniSEED record")]
    NotMiniSeed,

    #[error("blockette offset {next} does not advance past {current}")]
    InvalidBlocketteOffset { next: u16, current: u16 },

    #[error("blockette 1000 record length exponent {0} out of range")]
    InvalidRecordLength(u8),

    #[error("invalid date-time string: {0:?}")]
    InvalidTimestamp(String),

    #[error("year {year} or day-of-year {day} out of range")]
    DateOutOfRange { year: i32, day: i32 },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
