//! miniSEED record inspection.
//!
//! A v3 SeedLink data header does not carry the payload length, so the
//! payload itself must be examined: miniSEED 3 states its length in the
//! fixed header, miniSEED 2 hides it in blockette 1000 or, failing that,
//! implies it by where the next record header starts. The same
//! inspection also yields the record start time and `NET_STA` id used
//! for per-station resumption tracking.

use crate::error::{ProtocolError, Result};
use crate::payload::PayloadFormat;
use crate::swap;
use crate::timeutil;

/// Minimum buffered bytes before payload detection is attempted, and the
/// minimum legal v3 record size.
pub const MIN_PAYLOAD: usize = 64;
/// Receive buffer size; also the largest payload tracked for detection.
pub const MAX_PAYLOAD: usize = 16384;

/// Length of the miniSEED 3 fixed header.
const MS3_FIXED_LEN: usize = 40;
/// Length of the miniSEED 2 fixed header.
const MS2_FIXED_LEN: usize = 48;

/// Outcome of payload detection on a v3 data stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Detection {
    /// Record recognized and its total length determined.
    Complete { format: PayloadFormat, length: u32 },
    /// miniSEED 2 recognized, but more bytes are needed to find the length.
    Incomplete { format: PayloadFormat },
}

/// Examine a buffered payload prefix (at least [`MIN_PAYLOAD`] bytes).
///
/// Fails with [`ProtocolError::NotMiniSeed`] when the buffer holds
/// neither record flavor, which on a v3 data connection is fatal.
pub fn detect(buffer: &[u8]) -> Result<Detection> {
    if buffer.len() < MIN_PAYLOAD {
        return Err(ProtocolError::TooShort {
            expected: MIN_PAYLOAD,
            actual: buffer.len(),
        });
    }

    if is_mseed3_header(buffer) {
        let sid_length = buffer[33] as u32;
        let extra_length = u16::from_le_bytes([buffer[34], buffer[35]]) as u32;
        let payload_length =
            u32::from_le_bytes([buffer[36], buffer[37], buffer[38], buffer[39]]);
        return Ok(Detection::Complete {
            format: PayloadFormat::MSeed3,
            length: MS3_FIXED_LEN as u32 + sid_length + extra_length + payload_length,
        });
    }

    if is_mseed2_header(buffer) {
        if let Some(length) = mseed2_record_length(buffer)? {
            return Ok(Detection::Complete {
                format: PayloadFormat::MSeed2,
                length,
            });
        }
        return Ok(Detection::Incomplete {
            format: PayloadFormat::MSeed2,
        });
    }

    Err(ProtocolError::NotMiniSeed)
}

/// Station id and start time pulled from a data record for stream tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordIds {
    /// `NET_STA`; empty when the record does not carry one.
    pub station_id: String,
    /// ISO-8601 start time: 1e-4 s resolution for v2, ns for v3.
    pub start_time: String,
}

/// Extract tracking ids from a data record of the given format.
///
/// The buffer must hold at least [`MIN_PAYLOAD`] bytes. Only `MSeed2`
/// and `MSeed3` records carry ids; other formats yield an error.
pub fn record_ids(format: PayloadFormat, buffer: &[u8]) -> Result<RecordIds> {
    if buffer.len() < MIN_PAYLOAD {
        return Err(ProtocolError::TooShort {
            expected: MIN_PAYLOAD,
            actual: buffer.len(),
        });
    }

    match format {
        PayloadFormat::MSeed2 => mseed2_ids(buffer),
        PayloadFormat::MSeed3 => mseed3_ids(buffer),
        _ => Err(ProtocolError::NotMiniSeed),
    }
}

fn is_mseed3_header(buffer: &[u8]) -> bool {
    buffer.len() >= MS3_FIXED_LEN && buffer[0] == b'M' && buffer[1] == b'S' && buffer[2] == 3
}

fn is_mseed2_header(buffer: &[u8]) -> bool {
    if buffer.len() < MS2_FIXED_LEN {
        return false;
    }
    if !buffer[..6].iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if !matches!(buffer[6], b'D' | b'R' | b'Q' | b'M') {
        return false;
    }
    let (year, yday, _) = mseed2_year_day(buffer);
    valid_year_day(year, yday)
}

/// Read year and day-of-year in host order, swapping if they look bogus.
fn mseed2_year_day(buffer: &[u8]) -> (u16, u16, bool) {
    let mut year = u16::from_ne_bytes([buffer[20], buffer[21]]);
    let mut yday = u16::from_ne_bytes([buffer[22], buffer[23]]);
    let mut swapped = false;
    if !valid_year_day(year, yday) {
        swap::swap2(&mut year);
        swap::swap2(&mut yday);
        swapped = true;
    }
    (year, yday, swapped)
}

fn valid_year_day(year: u16, yday: u16) -> bool {
    (1900..=2100).contains(&year) && (1..=366).contains(&yday)
}

/// Find the v2 record length: blockette 1000 first, then a scan for the
/// next header at 64-byte offsets. `Ok(None)` means undetermined so far.
fn mseed2_record_length(buffer: &[u8]) -> Result<Option<u32>> {
    let (_, _, swapped) = mseed2_year_day(buffer);

    let mut offset = {
        let mut first = u16::from_ne_bytes([buffer[46], buffer[47]]);
        if swapped {
            swap::swap2(&mut first);
        }
        first
    };

    while offset != 0 && offset > 47 && (offset as usize + 4) <= buffer.len() {
        let at = offset as usize;
        let mut blockette_type = u16::from_ne_bytes([buffer[at], buffer[at + 1]]);
        let mut next = u16::from_ne_bytes([buffer[at + 2], buffer[at + 3]]);
        if swapped {
            swap::swap2(&mut blockette_type);
            swap::swap2(&mut next);
        }

        if blockette_type == 1000 && at + 8 <= buffer.len() {
            let exponent = buffer[at + 6];
            if !(6..=24).contains(&exponent) {
                return Err(ProtocolError::InvalidRecordLength(exponent));
            }
            return Ok(Some(1u32 << exponent));
        }

        // A chain that does not advance means a corrupt record.
        if next != 0 && (next < 4 || next - 4 <= offset) {
            return Err(ProtocolError::InvalidBlocketteOffset {
                next,
                current: offset,
            });
        }

        offset = next;
    }

    // No blockette 1000: look for the next record header at 64-byte
    // offsets, which implies the length of this one.
    let mut at = 64;
    while at + MS2_FIXED_LEN < buffer.len() {
        if is_mseed2_header(&buffer[at..]) {
            return Ok(Some(at as u32));
        }
        at += 64;
    }

    Ok(None)
}

fn mseed2_ids(buffer: &[u8]) -> Result<RecordIds> {
    let (year, yday, swapped) = mseed2_year_day(buffer);
    let hour = buffer[24];
    let minute = buffer[25];
    let second = buffer[26];
    let mut fract = u16::from_ne_bytes([buffer[28], buffer[29]]);
    if swapped {
        swap::swap2(&mut fract);
    }

    let (month, mday) = timeutil::doy2md(year as i32, yday as i32)?;
    let start_time = format!(
        "{year:04}-{month:02}-{mday:02}T{hour:02}:{minute:02}:{second:02}.{fract:04}Z"
    );

    let network = clean_field(&buffer[18..20]);
    let station = clean_field(&buffer[8..13]);
    let station_id = if network.is_empty() && station.is_empty() {
        String::new()
    } else {
        format!("{network}_{station}")
    };

    Ok(RecordIds {
        station_id,
        start_time,
    })
}

fn mseed3_ids(buffer: &[u8]) -> Result<RecordIds> {
    let nanosecond = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
    let year = u16::from_le_bytes([buffer[8], buffer[9]]);
    let yday = u16::from_le_bytes([buffer[10], buffer[11]]);
    let hour = buffer[12];
    let minute = buffer[13];
    let second = buffer[14];

    let (month, mday) = timeutil::doy2md(year as i32, yday as i32)?;
    let start_time = format!(
        "{year:04}-{month:02}-{mday:02}T{hour:02}:{minute:02}:{second:02}.{nanosecond:09}Z"
    );

    Ok(RecordIds {
        station_id: mseed3_station_id(buffer).unwrap_or_default(),
        start_time,
    })
}

/// Pull `NET_STA` out of the FDSN source identifier that follows the v3
/// fixed header: the bytes between the `FDSN:` prefix and the second
/// `_`, clamped to the station-id capacity.
fn mseed3_station_id(buffer: &[u8]) -> Option<String> {
    let sid_length = buffer[33] as usize;
    if sid_length <= 10 {
        return None;
    }
    let sid = buffer.get(MS3_FIXED_LEN..MS3_FIXED_LEN + sid_length)?;
    let body = sid.strip_prefix(b"FDSN:")?;

    let first = body.iter().position(|&b| b == b'_')?;
    let second = first + 1 + body[first + 1..].iter().position(|&b| b == b'_')?;

    let id = &body[..second.min(crate::frame::MAX_STATION_ID)];
    Some(String::from_utf8_lossy(id).into_owned())
}

/// Copy a fixed-width header field, dropping spaces and control bytes.
fn clean_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_graphic())
        .map(|&b| b as char)
        .collect()
}
