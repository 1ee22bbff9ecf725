//! SeedLink packet header parsing.
//!
//! Only headers are parsed here. Payload bytes follow the header on the
//! wire and are assembled by the client, because a v3 payload's length is
//! not carried in the header and must be inferred from the payload itself.

use crate::error::{ProtocolError, Result};
use crate::payload::PayloadFormat;
use crate::sequence::SequenceNumber;

pub const V3_SIGNATURE: &[u8; 2] = b"SL";
pub const V4_SIGNATURE: &[u8; 2] = b"SE";
pub const V3_INFO_SIGNATURE: &[u8; 6] = b"SLINFO";

/// v3 header: `"SL"` + 6 hex digits, or `"SLINFO "` + continuation flag.
pub const V3_HEADER_LEN: usize = 8;
/// v4 header: `"SE"` + format + subformat + length + sequence + sid length.
pub const V4_HEADER_LEN: usize = 17;

/// Station ids hold at most 21 bytes of `NET_STA`.
pub const MAX_STATION_ID: usize = 21;

/// A parsed SeedLink packet header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameHeader {
    /// v3 data packet; payload length must be inferred from the payload.
    V3Data { seqnum: SequenceNumber },
    /// v3 INFO packet; `terminated` is false when more chunks follow.
    V3Info { terminated: bool },
    /// v4 packet with explicit payload length and station id.
    V4 {
        format: PayloadFormat,
        subformat: u8,
        payload_length: u32,
        seqnum: SequenceNumber,
        station_id_length: u8,
    },
}

impl FrameHeader {
    /// Parse a v3 header from exactly [`V3_HEADER_LEN`] bytes.
    pub fn parse_v3(header: &[u8]) -> Result<Self> {
        if header.len() < V3_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: V3_HEADER_LEN,
                actual: header.len(),
            });
        }

        if header.starts_with(V3_INFO_SIGNATURE) {
            // Byte 7 is '*' when further INFO chunks follow.
            return Ok(Self::V3Info {
                terminated: header[V3_HEADER_LEN - 1] != b'*',
            });
        }

        if &header[..2] != V3_SIGNATURE {
            return Err(ProtocolError::InvalidSignature([header[0], header[1]]));
        }

        let hex = std::str::from_utf8(&header[2..V3_HEADER_LEN])
            .map_err(|_| ProtocolError::InvalidSequence("non-ASCII sequence field".into()))?;
        let seqnum = SequenceNumber::from_v3_header(hex)?;

        Ok(Self::V3Data { seqnum })
    }

    /// Parse a v4 header from exactly [`V4_HEADER_LEN`] bytes.
    pub fn parse_v4(header: &[u8]) -> Result<Self> {
        if header.len() < V4_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: V4_HEADER_LEN,
                actual: header.len(),
            });
        }

        if &header[..2] != V4_SIGNATURE {
            return Err(ProtocolError::InvalidSignature([header[0], header[1]]));
        }

        let format = PayloadFormat::from_wire(header[2])?;
        let subformat = header[3];
        let payload_length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let seqnum = SequenceNumber::from_v4_header([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);
        let station_id_length = header[16];

        if station_id_length as usize > MAX_STATION_ID {
            return Err(ProtocolError::StationIdTooLong(station_id_length as usize));
        }

        Ok(Self::V4 {
            format,
            subformat,
            payload_length,
            seqnum,
            station_id_length,
        })
    }
}

/// Build a v3 data header (for tests and mock servers).
pub fn build_v3_header(seqnum: u64) -> [u8; V3_HEADER_LEN] {
    let mut header = [0u8; V3_HEADER_LEN];
    header[..2].copy_from_slice(V3_SIGNATURE);
    header[2..].copy_from_slice(format!("{seqnum:06X}").as_bytes());
    header
}

/// Build a v3 INFO header (for tests and mock servers).
pub fn build_v3_info_header(terminated: bool) -> [u8; V3_HEADER_LEN] {
    let mut header = [0u8; V3_HEADER_LEN];
    header[..6].copy_from_slice(V3_INFO_SIGNATURE);
    header[6] = b' ';
    header[7] = if terminated { b' ' } else { b'*' };
    header
}

/// Build a complete v4 packet: header, station id, payload.
pub fn build_v4_packet(
    format: PayloadFormat,
    subformat: u8,
    seqnum: SequenceNumber,
    station_id: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(V4_HEADER_LEN + station_id.len() + payload.len());
    packet.extend_from_slice(V4_SIGNATURE);
    packet.push(format.code());
    packet.push(subformat);
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.extend_from_slice(&seqnum.to_v4_header());
    packet.push(station_id.len() as u8);
    packet.extend_from_slice(station_id.as_bytes());
    packet.extend_from_slice(payload);
    packet
}
