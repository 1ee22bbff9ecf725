use slink_protocol::glob::glob_match;
use slink_protocol::timeutil;
use slink_protocol::SequenceNumber;
use tracing::warn;

use crate::error::{ClientError, Result};

/// Station id of the single record used in all-station mode.
pub const ALL_STATION_ID: &str = "XX_UNI";

/// Station ids hold at most this many bytes.
const MAX_STATION_ID: usize = slink_protocol::frame::MAX_STATION_ID;
/// Timestamps hold at most this many bytes.
const MAX_TIMESTAMP: usize = 31;

/// One station subscription with its resumption state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// `NET_STA`, possibly wildcarded (`*`, `?`).
    pub station_id: String,
    /// Space-separated stream selectors, if any.
    pub selectors: Option<String>,
    /// Last observed sequence number.
    pub seqnum: SequenceNumber,
    /// ISO-8601 time of the last observed packet; empty when unknown.
    pub timestamp: String,
}

/// Ordered list of subscriptions.
///
/// Entries are kept in three partitions to stabilize iteration order:
/// exact ids first, then ids whose only wildcard is `?`, then ids
/// containing `*`; each partition is sorted ascending by id. Duplicate
/// ids are allowed.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    entries: Vec<StreamEntry>,
}

/// Partition index used for ordering: exact, `?`-only, contains-`*`.
fn partition_rank(station_id: &str) -> u8 {
    if station_id.contains('*') {
        2
    } else if station_id.contains('?') {
        1
    } else {
        0
    }
}

impl StreamRegistry {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }

    /// True when the registry holds the single all-station record.
    pub fn is_all_station(&self) -> bool {
        self.entries
            .first()
            .is_some_and(|entry| entry.station_id == ALL_STATION_ID)
    }

    /// Add a station subscription.
    ///
    /// Comma-form timestamps are normalized to ISO-8601. Fails when
    /// all-station mode is already configured or the timestamp is
    /// unparseable.
    pub fn add(
        &mut self,
        station_id: &str,
        selectors: Option<&str>,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> Result<()> {
        if self.is_all_station() {
            return Err(ClientError::ModeConflict(
                "all-station mode already configured",
            ));
        }

        let entry = Self::build_entry(station_id, selectors, seqnum, timestamp)?;

        // Insert at the end of this entry's (partition, id) run.
        let key = (partition_rank(&entry.station_id), entry.station_id.clone());
        let at = self
            .entries
            .partition_point(|e| (partition_rank(&e.station_id), e.station_id.clone()) <= key);
        self.entries.insert(at, entry);
        Ok(())
    }

    /// Switch to all-station mode with a single synthetic record.
    ///
    /// Fails when station subscriptions already exist.
    pub fn set_all_station(
        &mut self,
        selectors: Option<&str>,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> Result<()> {
        if !self.entries.is_empty() && !self.is_all_station() {
            return Err(ClientError::ModeConflict(
                "station subscriptions already configured",
            ));
        }

        let entry = Self::build_entry(ALL_STATION_ID, selectors, seqnum, timestamp)?;
        self.entries.clear();
        self.entries.push(entry);
        Ok(())
    }

    fn build_entry(
        station_id: &str,
        selectors: Option<&str>,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> Result<StreamEntry> {
        let mut station_id = station_id.to_owned();
        if station_id.len() > MAX_STATION_ID {
            warn!(station_id, "truncating oversized station id");
            station_id.truncate(MAX_STATION_ID);
        }

        let timestamp = match timestamp.filter(|t| !t.is_empty()) {
            None => String::new(),
            Some(raw) => timeutil::to_iso_datetime(raw)
                .ok_or_else(|| ClientError::InvalidTimestamp(raw.to_owned()))?,
        };

        Ok(StreamEntry {
            station_id,
            selectors: selectors.filter(|s| !s.is_empty()).map(|s| s.to_owned()),
            seqnum,
            timestamp,
        })
    }

    /// Record `(seqnum, timestamp)` for an incoming packet.
    ///
    /// In all-station mode the lone record is updated unconditionally.
    /// Otherwise every subscription whose (possibly wildcarded) id
    /// matches the concrete incoming id is updated. Returns the number
    /// of updated records; zero means the packet matched nothing.
    pub fn update(&mut self, station_id: &str, seqnum: SequenceNumber, timestamp: &str) -> usize {
        let timestamp = if timestamp.len() > MAX_TIMESTAMP {
            &timestamp[..MAX_TIMESTAMP]
        } else {
            timestamp
        };

        if self.is_all_station() {
            let entry = &mut self.entries[0];
            entry.seqnum = seqnum;
            entry.timestamp = timestamp.to_owned();
            return 1;
        }

        let mut updates = 0;
        for entry in &mut self.entries {
            if glob_match(station_id, &entry.station_id) {
                entry.seqnum = seqnum;
                entry.timestamp = timestamp.to_owned();
                updates += 1;
            }
        }
        updates
    }

    /// Restore `(seqnum, timestamp)` on the entry with exactly this id.
    pub(crate) fn restore(
        &mut self,
        station_id: &str,
        seqnum: SequenceNumber,
        timestamp: Option<&str>,
    ) -> bool {
        for entry in &mut self.entries {
            if entry.station_id == station_id {
                entry.seqnum = seqnum;
                if let Some(timestamp) = timestamp {
                    entry.timestamp = timestamp[..timestamp.len().min(MAX_TIMESTAMP)].to_owned();
                }
                return true;
            }
        }
        false
    }
}

/// Parse one stream-list line: `NET_STA [selectors...]`, with the legacy
/// `NET STA [selectors...]` form rewritten to `NET_STA`.
fn parse_streamlist_line(line: &str) -> Option<(String, Option<String>)> {
    let mut fields = line.split_whitespace();
    let first = fields.next()?;

    if first.contains('_') {
        let selectors: Vec<&str> = fields.collect();
        let selectors = (!selectors.is_empty()).then(|| selectors.join(" "));
        return Some((first.to_owned(), selectors));
    }

    // Legacy form: network and station as separate fields.
    let station = fields.next()?;
    let selectors: Vec<&str> = fields.collect();
    let selectors = (!selectors.is_empty()).then(|| selectors.join(" "));
    Some((format!("{first}_{station}"), selectors))
}

impl StreamRegistry {
    /// Add subscriptions from stream-list text: one `NET_STA
    /// [selectors...]` per line, `#` and `*` comment lines skipped.
    /// Entries without selectors receive `default_selectors`.
    ///
    /// Returns the number of subscriptions added.
    pub fn add_from_streamlist_text(
        &mut self,
        text: &str,
        default_selectors: Option<&str>,
    ) -> Result<usize> {
        let mut added = 0;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('*') {
                continue;
            }
            let (station_id, selectors) =
                parse_streamlist_line(line).ok_or_else(|| ClientError::StreamList {
                    entry: line.to_owned(),
                    reason: "expected NET_STA or NET STA".into(),
                })?;
            self.add(
                &station_id,
                selectors.as_deref().or(default_selectors),
                SequenceNumber::UNSET,
                None,
            )?;
            added += 1;
        }
        Ok(added)
    }

    /// Add subscriptions from a stream-list string:
    /// `NET_STA[:selector ...],NET_STA[:selector ...],...`.
    ///
    /// Returns the number of subscriptions added.
    pub fn add_from_streamlist(
        &mut self,
        list: &str,
        default_selectors: Option<&str>,
    ) -> Result<usize> {
        let mut added = 0;
        for raw in list.split(',') {
            let item = raw.trim();
            if item.is_empty() {
                continue;
            }
            let (id_part, selectors) = match item.split_once(':') {
                Some((id, sel)) => (id, Some(sel.trim())),
                None => (item, None),
            };
            let (station_id, _) =
                parse_streamlist_line(id_part).ok_or_else(|| ClientError::StreamList {
                    entry: item.to_owned(),
                    reason: "expected NET_STA".into(),
                })?;
            self.add(
                &station_id,
                selectors.filter(|s| !s.is_empty()).or(default_selectors),
                SequenceNumber::UNSET,
                None,
            )?;
            added += 1;
        }
        Ok(added)
    }
}
