//! Managed-buffer collection: the connection owns a payload buffer that
//! grows on demand and yields packets with owned payloads.

use futures_core::Stream;
use tracing::error;

use crate::collect::{Collect, PacketInfo, SeedLinkConnection};

/// A packet with its payload copied to the heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectedPacket {
    pub info: PacketInfo,
    pub payload: Vec<u8>,
}

impl SeedLinkConnection {
    /// Collect the next packet into an internally managed buffer.
    ///
    /// The buffer starts small and grows to fit oversized payloads, up
    /// to [`max_owned_payload`](crate::ClientConfig::max_owned_payload);
    /// a payload beyond the cap terminates the connection. Returns
    /// `None` once the connection has terminated.
    pub async fn next_packet(&mut self) -> Option<CollectedPacket> {
        let mut buffer = std::mem::take(&mut self.owned_buf);
        if buffer.len() < 512 {
            buffer.resize(512, 0);
        }

        let result = loop {
            match self.collect(&mut buffer).await {
                Collect::Packet(info) => {
                    let length = info.payload_length as usize;
                    break Some(CollectedPacket {
                        payload: buffer[..length].to_vec(),
                        info,
                    });
                }
                Collect::TooLarge(info) => {
                    let needed = info.payload_length as usize;
                    if needed > self.config().max_owned_payload {
                        error!(
                            needed,
                            cap = self.config().max_owned_payload,
                            "payload exceeds the configured buffer cap, terminating"
                        );
                        self.terminate();
                        break None;
                    }
                    // Growing preserves the collected prefix in place.
                    buffer.resize(needed, 0);
                }
                Collect::NoPacket => continue,
                Collect::Terminate => break None,
            }
        };

        self.owned_buf = buffer;
        result
    }

    /// Consume the connection and yield packets until termination.
    pub fn into_stream(mut self) -> impl Stream<Item = CollectedPacket> {
        async_stream::stream! {
            while let Some(packet) = self.next_packet().await {
                yield packet;
            }
        }
    }
}
