//! SeedLink v3/v4 wire protocol types.
//!
//! This crate holds the protocol layer shared by SeedLink tooling:
//! command and response text, packet header parsing for both header
//! generations, payload format codes, miniSEED record inspection (length
//! inference, start time, and station id extraction), plus the small
//! utilities the protocol leans on: glob matching for station ids,
//! date-time rewriting, and byte-order helpers.
//!
//! The connection machinery that drives these types against a live
//! server lives in the `slink-client` crate.

pub mod command;
pub mod error;
pub mod frame;
pub mod glob;
pub mod info;
pub mod inspect;
pub mod payload;
pub mod response;
pub mod sequence;
pub mod swap;
pub mod timeutil;
pub mod version;

pub use command::Command;
pub use error::{ProtocolError, Result};
pub use frame::FrameHeader;
pub use info::InfoLevel;
pub use payload::PayloadFormat;
pub use response::{Hello, Response};
pub use sequence::SequenceNumber;
pub use version::ProtocolVersion;

/// Library identification token sent in `USERAGENT` commands.
pub const LIBRARY_IDENT: &str = concat!("slink-rs/", env!("CARGO_PKG_VERSION"));
