//! Async SeedLink client: the connection lifecycle engine.
//!
//! A [`SeedLinkConnection`] owns the whole life of a session with a
//! SeedLink v3/v4 server: it connects, negotiates protocol version and
//! data selection, then frames packets out of the receive stream while
//! handling reconnection, keepalives, idle timeouts, and per-station
//! resumption via tracked sequence numbers.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> slink_client::Result<()> {
//! use slink_client::{Collect, SeedLinkConnection};
//! use slink_protocol::SequenceNumber;
//!
//! let mut conn = SeedLinkConnection::new("rtserve.iris.washington.edu:18000");
//! conn.add_stream("IU_ANMO", Some("BHZ"), SequenceNumber::UNSET, None)?;
//! conn.recover_state("anmo.state")?;
//!
//! while let Some(packet) = conn.next_packet().await {
//!     println!(
//!         "{} seq {} ({} bytes)",
//!         packet.info.station_id,
//!         packet.info.seqnum,
//!         packet.payload.len()
//!     );
//! }
//! conn.save_state("anmo.state")?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod auth;
pub(crate) mod collect;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod negotiate;
pub(crate) mod owned;
pub(crate) mod statefile;
pub(crate) mod streams;

pub use auth::{AuthProvider, StaticAuth};
pub use collect::{Collect, PacketInfo, SeedLinkConnection, TerminateHandle};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use negotiate::{ping, ServerInfo};
pub use owned::CollectedPacket;
pub use streams::{StreamEntry, StreamRegistry, ALL_STATION_ID};

pub use statefile::{deserialize as read_state, serialize as write_state};
