//! Saving and recovering per-station resumption state.
//!
//! One record per line: `<station_id> <seqnum|-1> [<timestamp>]`, where
//! the station id is `NET_STA` and the timestamp is ISO-8601. The legacy
//! four-field form `<NET> <STA> <seqnum> [<timestamp>]` and legacy
//! comma-delimited timestamps are accepted on read. Lines starting with
//! `#` or `*` are comments.

use std::io::{BufRead, Write};

use slink_protocol::timeutil;
use slink_protocol::SequenceNumber;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::streams::StreamRegistry;

/// Write every subscription's `(id, seqnum, timestamp)` to `writer`.
pub fn serialize<W: Write>(registry: &StreamRegistry, writer: &mut W) -> Result<()> {
    for entry in registry.entries() {
        if entry.seqnum.is_unset() {
            writeln!(writer, "{} -1 {}", entry.station_id, entry.timestamp)?;
        } else {
            writeln!(
                writer,
                "{} {} {}",
                entry.station_id,
                entry.seqnum.value(),
                entry.timestamp
            )?;
        }
    }
    Ok(())
}

/// Read state records and apply them to matching subscriptions.
///
/// Records whose station id has no exact-match subscription are ignored.
/// Returns the number of records applied.
pub fn deserialize<R: BufRead>(registry: &mut StreamRegistry, reader: R) -> Result<usize> {
    let mut applied = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('*') {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();

        // Current form first, then the legacy NET STA split.
        let (station_id, seq_field, time_field) = if fields.len() >= 2 && fields[0].contains('_') {
            (fields[0].to_owned(), fields[1], fields.get(2).copied())
        } else if fields.len() >= 3 {
            (
                format!("{}_{}", fields[0], fields[1]),
                fields[2],
                fields.get(3).copied(),
            )
        } else {
            return Err(ClientError::StateFile {
                line: number,
                reason: format!("unparseable record: {trimmed:?}"),
            });
        };

        let seqnum = if seq_field == "-1" {
            SequenceNumber::UNSET
        } else {
            match seq_field.parse::<u64>() {
                Ok(value) => SequenceNumber::new(value),
                Err(_) => {
                    return Err(ClientError::StateFile {
                        line: number,
                        reason: format!("bad sequence number: {seq_field:?}"),
                    });
                }
            }
        };

        let timestamp = match time_field {
            None => None,
            Some(raw) => Some(timeutil::to_iso_datetime(raw).ok_or_else(|| {
                ClientError::StateFile {
                    line: number,
                    reason: format!("bad timestamp: {raw:?}"),
                }
            })?),
        };

        if registry.restore(&station_id, seqnum, timestamp.as_deref()) {
            applied += 1;
        } else {
            debug!(station_id, "state record has no matching subscription");
        }
    }

    Ok(applied)
}

/// Save the registry to `path`, replacing any existing file.
pub fn save(registry: &StreamRegistry, path: &str) -> Result<()> {
    debug!(path, "saving connection state");
    let mut file = std::fs::File::create(path)?;
    serialize(registry, &mut file)?;
    file.flush()?;
    Ok(())
}

/// Recover state from `path` into the registry.
///
/// A missing file is not an error; it returns `Ok(0)` so a first run
/// starts from scratch.
pub fn recover(registry: &mut StreamRegistry, path: &str) -> Result<usize> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path, "state file not found");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    debug!(path, "recovering connection state");
    deserialize(registry, std::io::BufReader::new(file))
}
