//! Scripted in-process SeedLink server for tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct MockConfig {
    pub hello_line1: String,
    pub hello_line2: String,
    pub accept_slproto: bool,
    /// Reply line for `GETCAPABILITIES`.
    pub capabilities_reply: String,
    /// Reply to `DATA`/`FETCH`/`TIME` and stream on `END` (multi-station
    /// and v4 behavior). When false, streaming starts right after the
    /// action command with no reply (v3 uni-station behavior).
    pub reply_to_actions: bool,
    /// Packets written when streaming starts.
    pub frames: Vec<Vec<u8>>,
    /// Per-connection overrides of `frames`, by connection index.
    pub connection_frames: Option<Vec<Vec<Vec<u8>>>>,
    /// Packets written in response to `INFO`.
    pub info_frames: Vec<Vec<u8>>,
    /// Send `END\r` after the streamed frames (dial-up completion).
    pub end_after_stream: bool,
    /// Close the connection after the streamed frames.
    pub close_after_stream: bool,
    pub max_connections: usize,
}

impl MockConfig {
    pub fn v3_default(frames: Vec<Vec<u8>>) -> Self {
        Self {
            hello_line1: "SeedLink v3.1 (2020.001) :: SLPROTO:3.1 CAP EXTREPLY".to_owned(),
            hello_line2: "Mock Data Center".to_owned(),
            accept_slproto: false,
            capabilities_reply: String::new(),
            reply_to_actions: true,
            frames,
            connection_frames: None,
            info_frames: Vec::new(),
            end_after_stream: false,
            close_after_stream: false,
            max_connections: 1,
        }
    }

    pub fn v4_default(frames: Vec<Vec<u8>>) -> Self {
        Self {
            hello_line1: "SeedLink v4.0 :: SLPROTO:3.1 SLPROTO:4.0 CAP".to_owned(),
            hello_line2: "Mock Data Center v4".to_owned(),
            accept_slproto: true,
            capabilities_reply: "SLPROTO:3.1 SLPROTO:4.0 CAP EXTREPLY".to_owned(),
            reply_to_actions: true,
            frames,
            connection_frames: None,
            info_frames: Vec::new(),
            end_after_stream: false,
            close_after_stream: false,
            max_connections: 1,
        }
    }
}

/// Commands received, grouped per accepted connection.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<Vec<String>>>>);

impl Captured {
    pub fn connection(&self, index: usize) -> Vec<String> {
        self.0.lock().unwrap().get(index).cloned().unwrap_or_default()
    }

    fn open_connection(&self) {
        self.0.lock().unwrap().push(Vec::new());
    }

    fn push(&self, command: String) {
        if let Some(current) = self.0.lock().unwrap().last_mut() {
            current.push(command);
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    captured: Captured,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Captured::default();

        let task_captured = captured.clone();
        tokio::spawn(async move {
            let config = Arc::new(config);
            for index in 0..config.max_connections {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                task_captured.open_connection();
                serve(stream, &config, &task_captured, index).await;
            }
        });

        Self { addr, captured }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn captured(&self) -> &Captured {
        &self.captured
    }
}

/// Read one CR-terminated command, tolerating a trailing LF.
async fn read_command(stream: &mut TcpStream) -> Option<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.ok()?;
        match byte {
            b'\r' => break,
            b'\n' if line.is_empty() => continue,
            _ => line.push(byte),
        }
    }
    Some(String::from_utf8_lossy(&line).trim().to_owned())
}

async fn serve(mut stream: TcpStream, config: &MockConfig, captured: &Captured, index: usize) {
    let frames = config
        .connection_frames
        .as_ref()
        .and_then(|per| per.get(index))
        .unwrap_or(&config.frames);
    let mut batch = false;

    while let Some(command) = read_command(&mut stream).await {
        captured.push(command.clone());
        let upper = command.to_uppercase();

        let reply: Option<Vec<u8>> = if upper == "HELLO" {
            Some(format!("{}\r\n{}\r\n", config.hello_line1, config.hello_line2).into_bytes())
        } else if upper.starts_with("SLPROTO") {
            if config.accept_slproto {
                Some(b"OK\r\n".to_vec())
            } else {
                Some(b"ERROR UNSUPPORTED unsupported protocol\r\n".to_vec())
            }
        } else if upper == "GETCAPABILITIES" {
            Some(format!("{}\r\n", config.capabilities_reply).into_bytes())
        } else if upper.starts_with("USERAGENT")
            || upper.starts_with("AUTH")
            || upper.starts_with("CAPABILITIES")
        {
            Some(b"OK\r\n".to_vec())
        } else if upper == "BATCH" {
            batch = true;
            Some(b"OK\r\n".to_vec())
        } else if upper.starts_with("STATION") || upper.starts_with("SELECT") {
            (!batch).then(|| b"OK\r\n".to_vec())
        } else if upper.starts_with("DATA") || upper.starts_with("FETCH") || upper.starts_with("TIME")
        {
            if config.reply_to_actions {
                (!batch).then(|| b"OK\r\n".to_vec())
            } else {
                // Uni-station: the action command starts the stream.
                if stream_frames(&mut stream, frames, config).await.is_err() {
                    break;
                }
                if config.close_after_stream {
                    break;
                }
                None
            }
        } else if upper == "END" {
            if stream_frames(&mut stream, frames, config).await.is_err() {
                break;
            }
            if config.close_after_stream {
                break;
            }
            None
        } else if upper.starts_with("INFO") {
            let mut failed = false;
            for frame in &config.info_frames {
                if stream.write_all(frame).await.is_err() {
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }
            let _ = stream.flush().await;
            None
        } else if upper == "BYE" {
            break;
        } else {
            None
        };

        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() {
                break;
            }
            let _ = stream.flush().await;
        }
    }
}

async fn stream_frames(
    stream: &mut TcpStream,
    frames: &[Vec<u8>],
    config: &MockConfig,
) -> std::io::Result<()> {
    for frame in frames {
        stream.write_all(frame).await?;
    }
    if config.end_after_stream {
        stream.write_all(b"END\r").await?;
    }
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::Collect;
    use crate::config::ClientConfig;
    use crate::SeedLinkConnection;
    use slink_protocol::frame::{build_v3_header, build_v4_packet};
    use slink_protocol::{PayloadFormat, SequenceNumber};

    fn mseed2_record(network: &str, station: &str, seq_text: &[u8; 6]) -> Vec<u8> {
        let mut rec = vec![0u8; 512];
        rec[..6].copy_from_slice(seq_text);
        rec[6] = b'D';
        rec[7] = b' ';
        for (i, b) in station.bytes().chain(std::iter::repeat(b' ')).take(5).enumerate() {
            rec[8 + i] = b;
        }
        rec[15] = b'B';
        rec[16] = b'H';
        rec[17] = b'Z';
        for (i, b) in network.bytes().chain(std::iter::repeat(b' ')).take(2).enumerate() {
            rec[18 + i] = b;
        }
        rec[20..22].copy_from_slice(&2023u16.to_ne_bytes());
        rec[22..24].copy_from_slice(&166u16.to_ne_bytes());
        rec[24] = 12;
        rec[46..48].copy_from_slice(&48u16.to_ne_bytes());
        rec[48..50].copy_from_slice(&1000u16.to_ne_bytes());
        rec[52] = 10;
        rec[53] = 1;
        rec[54] = 9;
        rec
    }

    fn v3_frame(seq: u64, network: &str, station: &str) -> Vec<u8> {
        let mut frame = build_v3_header(seq).to_vec();
        frame.extend_from_slice(&mseed2_record(network, station, b"000001"));
        frame
    }

    fn v4_frame(seq: u64, station_id: &str) -> Vec<u8> {
        build_v4_packet(
            PayloadFormat::MSeed3,
            0,
            SequenceNumber::new(seq),
            station_id,
            &[0xCD; 128],
        )
    }

    fn quick_config() -> ClientConfig {
        ClientConfig {
            reconnect_delay: std::time::Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn v3_multi_station_flow() {
        let frames = vec![v3_frame(1, "IU", "ANMO"), v3_frame(2, "IU", "ANMO")];
        let server = MockServer::start(MockConfig::v3_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream("IU_ANMO", Some("BHZ"), SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        let first = conn.collect(&mut buffer).await;
        match first {
            Collect::Packet(info) => {
                assert_eq!(info.seqnum, SequenceNumber::new(1));
                assert_eq!(info.station_id, "IU_ANMO");
                assert_eq!(info.payload_format, PayloadFormat::MSeed2);
                assert_eq!(info.payload_length, 512);
            }
            other => panic!("expected packet, got {other:?}"),
        }

        let second = conn.collect(&mut buffer).await;
        assert!(matches!(second, Collect::Packet(ref info) if info.seqnum == SequenceNumber::new(2)));

        let sent = server.captured().connection(0);
        assert_eq!(sent[0], "HELLO");
        assert_eq!(sent[1], "CAPABILITIES SLPROTO:3.1 EXTREPLY");
        assert_eq!(sent[2], "STATION ANMO IU");
        assert_eq!(sent[3], "SELECT BHZ");
        assert_eq!(sent[4], "DATA");
        assert_eq!(sent[5], "END");
    }

    #[tokio::test]
    async fn v3_uni_station_flow() {
        let frames = vec![v3_frame(1, "IU", "ANMO")];
        let config = MockConfig {
            reply_to_actions: false,
            ..MockConfig::v3_default(frames)
        };
        let server = MockServer::start(config).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.set_all_station(Some("BHZ"), SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        let result = conn.collect(&mut buffer).await;
        assert!(matches!(result, Collect::Packet(_)));

        // The lone all-station record tracks every packet.
        let entry = &conn.streams().entries()[0];
        assert_eq!(entry.station_id, crate::streams::ALL_STATION_ID);
        assert_eq!(entry.seqnum, SequenceNumber::new(1));

        let sent = server.captured().connection(0);
        assert_eq!(sent[2], "SELECT BHZ");
        assert_eq!(sent[3], "DATA");
        // Uni-station mode never sends END.
        assert!(!sent.contains(&"END".to_owned()));
    }

    #[tokio::test]
    async fn v4_upgrade_and_flow() {
        let frames = vec![v4_frame(42, "IU_ANMO")];
        let server = MockServer::start(MockConfig::v4_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream("IU_*", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        let result = conn.collect(&mut buffer).await;
        match result {
            Collect::Packet(info) => {
                assert_eq!(info.seqnum, SequenceNumber::new(42));
                assert_eq!(info.station_id, "IU_ANMO");
                assert_eq!(info.payload_format, PayloadFormat::MSeed3);
                assert_eq!(info.payload_length, 128);
            }
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(conn.protocol(), slink_protocol::ProtocolVersion::V4);

        let sent = server.captured().connection(0);
        assert_eq!(sent[0], "HELLO");
        assert_eq!(sent[1], "SLPROTO 4.0");
        assert_eq!(sent[2], "GETCAPABILITIES");
        assert!(sent[3].starts_with("USERAGENT"));
        assert!(sent[3].contains("slink-rs/"));
        assert_eq!(sent[4], "STATION IU_*");
        assert_eq!(sent[5], "DATA");
        assert_eq!(sent[6], "END");
    }

    #[tokio::test]
    async fn v3_resume_sends_sequence_and_time() {
        let frames = vec![v3_frame(6, "IU", "ANMO")];
        let server = MockServer::start(MockConfig::v3_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream(
            "IU_ANMO",
            None,
            SequenceNumber::new(5),
            Some("2023-06-15T12:00:00Z"),
        )
        .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));

        let sent = server.captured().connection(0);
        assert_eq!(sent[3], "DATA 0000000000000006 2023,06,15,12,00,00");
    }

    #[tokio::test]
    async fn v3_batch_mode_skips_replies() {
        let frames = vec![v3_frame(1, "IU", "ANMO")];
        let mut mock = MockConfig::v3_default(frames);
        mock.hello_line1 = "SeedLink v3.1 :: SLPROTO:3.1 CAP".to_owned();
        let server = MockServer::start(mock).await;

        let mut config = quick_config();
        config.batch = true;
        let mut conn = SeedLinkConnection::with_config(&server.address(), config);
        conn.add_stream("IU_ANMO", Some("BHZ"), SequenceNumber::UNSET, None)
            .unwrap();
        conn.add_stream("GE_WLF", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));

        let sent = server.captured().connection(0);
        assert_eq!(sent[2], "BATCH");
        assert_eq!(sent[3], "STATION WLF GE");
        assert_eq!(sent[4], "DATA");
        assert_eq!(sent[5], "STATION ANMO IU");
        assert_eq!(sent[6], "SELECT BHZ");
        assert_eq!(sent[7], "DATA");
        assert_eq!(sent[8], "END");
    }

    #[tokio::test]
    async fn v4_auth_credentials_are_sent() {
        let frames = vec![v4_frame(1, "IU_ANMO")];
        let server = MockServer::start(MockConfig::v4_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.set_auth(crate::auth::StaticAuth("USERPASS who secret".into()));
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));

        let sent = server.captured().connection(0);
        assert!(sent[3].starts_with("USERAGENT"));
        assert_eq!(sent[4], "AUTH USERPASS who secret");
        assert_eq!(sent[5], "STATION IU_ANMO");
    }

    #[tokio::test]
    async fn batch_activation_is_reported() {
        let frames = vec![v3_frame(1, "IU", "ANMO")];
        let server = MockServer::start(MockConfig::v3_default(frames)).await;

        let mut config = quick_config();
        config.batch = true;
        let mut conn = SeedLinkConnection::with_config(&server.address(), config);
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));
        assert!(conn.batch_active());
    }

    #[tokio::test]
    async fn dialup_end_terminates() {
        let frames = vec![v3_frame(1, "IU", "ANMO")];
        let config = MockConfig {
            end_after_stream: true,
            ..MockConfig::v3_default(frames)
        };
        let server = MockServer::start(config).await;

        let mut client_config = quick_config();
        client_config.dialup = true;
        let mut conn = SeedLinkConnection::with_config(&server.address(), client_config);
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Terminate));
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Terminate));

        let sent = server.captured().connection(0);
        assert_eq!(sent[3], "FETCH");
    }

    #[tokio::test]
    async fn reconnect_resumes_from_tracked_sequence() {
        let config = MockConfig {
            close_after_stream: true,
            max_connections: 2,
            connection_frames: Some(vec![
                vec![v3_frame(10, "IU", "ANMO")],
                vec![v3_frame(11, "IU", "ANMO")],
            ]),
            ..MockConfig::v3_default(vec![])
        };
        let server = MockServer::start(config).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        let first = conn.collect(&mut buffer).await;
        assert!(matches!(first, Collect::Packet(ref info) if info.seqnum == SequenceNumber::new(10)));

        // The server drops the connection; the driver reconnects after
        // the delay and resumes past sequence 10.
        let second = conn.collect(&mut buffer).await;
        assert!(matches!(second, Collect::Packet(ref info) if info.seqnum == SequenceNumber::new(11)));

        let replay = server.captured().connection(1);
        assert_eq!(replay[2], "STATION ANMO IU");
        assert!(
            replay[3].starts_with("DATA 000000000000000B"),
            "resume command was {:?}",
            replay[3]
        );
    }

    #[tokio::test]
    async fn non_blocking_returns_no_packet() {
        let server = MockServer::start(MockConfig::v3_default(vec![])).await;

        let mut config = quick_config();
        config.non_blocking = true;
        let mut conn = SeedLinkConnection::with_config(&server.address(), config);
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::NoPacket));
    }

    #[tokio::test]
    async fn terminate_is_graceful() {
        let frames = vec![v3_frame(1, "IU", "ANMO"), v3_frame(2, "IU", "ANMO")];
        let server = MockServer::start(MockConfig::v3_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let mut buffer = vec![0u8; 1024];
        assert!(matches!(conn.collect(&mut buffer).await, Collect::Packet(_)));

        // Terminate while a whole packet may still be buffered: it is
        // drained before the driver exits.
        let handle = conn.terminate_handle();
        handle.terminate();

        let mut saw_second = false;
        loop {
            match conn.collect(&mut buffer).await {
                Collect::Packet(info) => {
                    assert_eq!(info.seqnum, SequenceNumber::new(2));
                    saw_second = true;
                }
                Collect::Terminate => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        // Both packets usually arrive in one read; tolerate the race
        // where the second had not been buffered yet.
        let _ = saw_second;
    }

    #[tokio::test]
    async fn owned_collection_grows_buffer() {
        let frames = vec![v4_frame(1, "IU_ANMO")];
        let server = MockServer::start(MockConfig::v4_default(frames)).await;

        let mut conn = SeedLinkConnection::with_config(&server.address(), quick_config());
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();

        let packet = conn.next_packet().await.unwrap();
        assert_eq!(packet.info.seqnum, SequenceNumber::new(1));
        assert_eq!(packet.payload.len(), 128);
        assert!(packet.payload.iter().all(|&b| b == 0xCD));
    }

    #[tokio::test]
    async fn stream_adapter_yields_until_close() {
        use std::pin::pin;
        use tokio_stream::StreamExt;

        let frames = vec![v3_frame(1, "IU", "ANMO"), v3_frame(2, "IU", "ANMO")];
        let config = MockConfig {
            close_after_stream: true,
            ..MockConfig::v3_default(frames)
        };
        let server = MockServer::start(config).await;

        let mut client_config = quick_config();
        // One reconnect attempt will fail; terminate instead of retrying
        // forever by marking the address permanently after the test.
        client_config.reconnect_delay = std::time::Duration::from_millis(20);
        let mut conn = SeedLinkConnection::with_config(&server.address(), client_config);
        conn.add_stream("IU_ANMO", None, SequenceNumber::UNSET, None)
            .unwrap();
        let handle = conn.terminate_handle();

        let mut stream = pin!(conn.into_stream());

        let first = stream.next().await.unwrap();
        assert_eq!(first.info.seqnum, SequenceNumber::new(1));
        let second = stream.next().await.unwrap();
        assert_eq!(second.info.seqnum, SequenceNumber::new(2));

        // No more connections are accepted; stop the loop.
        handle.terminate();
        assert!(stream.next().await.is_none());
    }
}
