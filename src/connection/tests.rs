use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

use super::*;
use crate::errors::WebsocketCodecError;

/// Hands the session one end of an in-memory pipe.
struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
    attempts: Arc<AtomicUsize>,
}

impl Connector for DuplexConnector {
    async fn connect(&self, _target: &Target) -> Result<BoxedStream, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let stream = self.stream.lock().unwrap().take().ok_or_else(|| {
            ConnectionError::ConnectFailed(std::io::ErrorKind::ConnectionRefused.into())
        })?;
        Ok(Box::new(stream))
    }
}

/// The server side of the pipe, speaking raw bytes.
struct Peer {
    stream: DuplexStream,
}

impl Peer {
    async fn read_request(&mut self) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(self.stream.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    fn client_key(request: &str) -> String {
        request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_owned())
            })
            .expect("request carries a key")
    }

    fn switching_protocols(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        )
    }

    /// Answer the opening handshake correctly and return the request head.
    async fn handshake(&mut self) -> String {
        let request = self.read_request().await;
        let response = Self::switching_protocols(&accept_key(&Self::client_key(&request)));
        self.stream.write_all(response.as_bytes()).await.unwrap();
        request
    }

    /// Read one masked client frame, returning its first header byte and unmasked payload.
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let first = self.stream.read_u8().await.unwrap();
        let second = self.stream.read_u8().await.unwrap();
        assert_eq!(second & 0x80, 0x80, "client frames must be masked");
        let len = match second & 0x7F {
            126 => u64::from(self.stream.read_u16().await.unwrap()),
            127 => self.stream.read_u64().await.unwrap(),
            n => u64::from(n),
        };
        let mut key = [0u8; 4];
        self.stream.read_exact(&mut key).await.unwrap();
        let mut payload = vec![0u8; usize::try_from(len).unwrap()];
        self.stream.read_exact(&mut payload).await.unwrap();
        crate::codec::apply_mask(&mut payload, key);
        (first, payload)
    }

    /// Write one unmasked server frame with a short payload.
    async fn write_frame(&mut self, first: u8, payload: &[u8]) {
        let mut frame = vec![first, u8::try_from(payload.len()).unwrap()];
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }
}

fn builder() -> SessionBuilder {
    Session::builder(http::Uri::from_static("ws://localhost:9001/chat"))
}

fn pair(builder: SessionBuilder) -> (Session<DuplexConnector>, Peer, Arc<AtomicUsize>) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = DuplexConnector {
        stream: Mutex::new(Some(client)),
        attempts: Arc::clone(&attempts),
    };
    let session = builder.connector(connector).build().unwrap();
    (session, Peer { stream: server }, attempts)
}

async fn connected(builder: SessionBuilder) -> (Session<DuplexConnector>, Peer) {
    let (mut session, mut peer, _) = pair(builder);
    let (opened, _) = tokio::join!(session.open(None), peer.handshake());
    assert!(opened.unwrap());
    (session, peer)
}

fn recorder() -> (Arc<Mutex<Vec<WebsocketMessage>>>, SessionBuilder) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let builder = builder().on_message(move |m| sink.lock().unwrap().push(m.clone()));
    (seen, builder)
}

#[tokio::test]
async fn open_performs_handshake() {
    let (mut session, mut peer, attempts) = pair(builder());
    assert_eq!(session.state(), ConnectionState::Idle);

    let (opened, request) = tokio::join!(session.open(None), peer.handshake());
    assert!(opened.unwrap());
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
    assert!(request.contains("host: localhost:9001\r\n"));
    assert!(request.contains("upgrade: websocket\r\n"));
    assert!(request.contains("connection: Upgrade\r\n"));
    assert!(request.contains("sec-websocket-version: 13\r\n"));
    assert_eq!(
        Peer::client_key(&request),
        session.handshake_key.clone().unwrap()
    );
}

#[tokio::test]
async fn open_uses_resource_override() {
    let (mut session, mut peer, _) = pair(builder());
    let (opened, request) = tokio::join!(session.open(Some("/other?x=1")), peer.handshake());
    assert!(opened.unwrap());
    assert!(request.starts_with("GET /other?x=1 HTTP/1.1\r\n"));
}

#[tokio::test]
async fn rejected_handshake_blocks_second_open() {
    let (mut session, mut peer, attempts) = pair(builder());
    let server = async {
        peer.read_request().await;
        peer.stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    };
    let (opened, ()) = tokio::join!(session.open(None), server);
    match opened {
        Err(ConnectionError::HandshakeRejected(response)) => {
            assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Connecting);

    assert!(!session.open(None).await.unwrap());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn wrong_accept_fails_validation() {
    let (mut session, mut peer, _) = pair(builder());
    let server = async {
        peer.read_request().await;
        let response = Peer::switching_protocols("AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        peer.stream.write_all(response.as_bytes()).await.unwrap();
    };
    let (opened, ()) = tokio::join!(session.open(None), server);
    assert!(matches!(
        opened,
        Err(ConnectionError::HandshakeValidationFailed("Sec-WebSocket-Accept"))
    ));
    assert_eq!(session.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn any_mismatched_header_leaves_session_connecting() {
    type Mangle = fn(&str) -> String;
    let cases: [(&str, Mangle); 5] = [
        ("Upgrade", |r| r.replace("Upgrade: websocket", "Upgrade: h2c")),
        ("Connection", |r| r.replace("Connection: Upgrade", "Connection: keep-alive")),
        ("Sec-WebSocket-Accept", |r| {
            let start = r.find("Sec-WebSocket-Accept: ").unwrap();
            let end = start + r[start..].find("\r\n").unwrap();
            format!("{}Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA={}", &r[..start], &r[end..])
        }),
        ("Sec-WebSocket-Extensions", |r| {
            r.replace("\r\n\r\n", "\r\nSec-WebSocket-Extensions: permessage-deflate\r\n\r\n")
        }),
        ("Sec-WebSocket-Protocol", |r| {
            r.replace("\r\n\r\n", "\r\nSec-WebSocket-Protocol: chat\r\n\r\n")
        }),
    ];

    for (field, mangle) in cases {
        let (mut session, mut peer, attempts) = pair(builder());
        let server = async {
            let request = peer.read_request().await;
            let valid = Peer::switching_protocols(&accept_key(&Peer::client_key(&request)));
            peer.stream.write_all(mangle(&valid).as_bytes()).await.unwrap();
        };
        let (opened, ()) = tokio::join!(session.open(None), server);
        match opened {
            Err(ConnectionError::HandshakeValidationFailed(name)) => assert_eq!(name, field),
            other => panic!("{field}: expected validation failure, got {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Connecting, "{field}");

        assert!(!session.open(None).await.unwrap(), "{field}");
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "{field}");
    }
}

#[tokio::test]
async fn text_round_trip() {
    let (mut session, mut peer) = connected(builder()).await;
    for text in ["foo", "∆AIMON"] {
        session.send_text(text).await.unwrap();
        let (first, payload) = peer.read_frame().await;
        assert_eq!(first, 0x81);
        assert_eq!(payload, text.as_bytes());

        peer.write_frame(0x81, &payload).await;
        assert_eq!(
            session.receive_message().await.unwrap(),
            Some(WebsocketMessage::Text(text.to_owned()))
        );
    }
}

#[tokio::test]
async fn binary_round_trip() {
    let (mut session, mut peer) = connected(builder()).await;
    session.send_binary(&[0, 159, 146, 150]).await.unwrap();
    let (first, payload) = peer.read_frame().await;
    assert_eq!(first, 0x82);
    peer.write_frame(0x82, &payload).await;
    assert_eq!(
        session.receive_message().await.unwrap(),
        Some(WebsocketMessage::Binary(vec![0, 159, 146, 150]))
    );
}

#[tokio::test]
async fn frames_sent_with_the_handshake_response_are_kept() {
    let (mut session, mut peer, _) = pair(builder());
    let server = async {
        let request = peer.read_request().await;
        let mut bytes =
            Peer::switching_protocols(&accept_key(&Peer::client_key(&request))).into_bytes();
        bytes.extend_from_slice(&[0x81, 0x05]);
        bytes.extend_from_slice(b"early");
        peer.stream.write_all(&bytes).await.unwrap();
    };
    let (opened, ()) = tokio::join!(session.open(None), server);
    assert!(opened.unwrap());
    assert_eq!(
        session.receive_message().await.unwrap(),
        Some(WebsocketMessage::Text("early".into()))
    );
}

#[tokio::test]
async fn ping_is_answered_and_not_delivered() {
    let (seen, builder) = recorder();
    let (mut session, mut peer) = connected(builder).await;

    peer.write_frame(0x89, b"hb").await;
    peer.write_frame(0x81, b"after").await;
    assert_eq!(
        session.receive_message().await.unwrap(),
        Some(WebsocketMessage::Text("after".into()))
    );

    assert_eq!(peer.read_frame().await, (0x8A, b"hb".to_vec()));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![WebsocketMessage::Text("after".into())]
    );
}

#[tokio::test]
async fn ping_waits_for_pong() {
    let (seen, builder) = recorder();
    let (mut session, mut peer) = connected(builder).await;

    let server = async {
        let (first, payload) = peer.read_frame().await;
        assert_eq!(first, 0x89);
        peer.write_frame(0x81, b"mid").await;
        peer.write_frame(0x8A, &payload).await;
    };
    let (pong, ()) = tokio::join!(session.ping(Some(b"abc".as_slice())), server);
    assert_eq!(pong.unwrap(), b"abc");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![WebsocketMessage::Text("mid".into())]
    );
}

#[tokio::test]
async fn oversized_ping_payload_is_refused() {
    let (mut session, _peer) = connected(builder()).await;
    assert!(matches!(
        session.ping(Some([0u8; 126].as_slice())).await,
        Err(ConnectionError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn fragmented_frame_is_rejected() {
    let (seen, builder) = recorder();
    let (mut session, mut peer) = connected(builder).await;

    peer.write_frame(0x01, b"par").await;
    assert!(matches!(
        session.receive_message().await,
        Err(ConnectionError::Codec(
            WebsocketCodecError::FragmentationUnsupported
        ))
    ));
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn masked_server_frame_is_unmasked() {
    let (mut session, mut peer) = connected(builder()).await;
    let key = [0x11, 0x22, 0x33, 0x44];
    let mut payload = b"foo".to_vec();
    crate::codec::apply_mask(&mut payload, key);
    let mut frame = vec![0x81, 0x80 | 3];
    frame.extend_from_slice(&key);
    frame.extend_from_slice(&payload);
    peer.stream.write_all(&frame).await.unwrap();

    assert_eq!(
        session.receive_message().await.unwrap(),
        Some(WebsocketMessage::Text("foo".into()))
    );
}

#[tokio::test]
async fn unknown_control_opcode_is_a_violation() {
    let (mut session, mut peer) = connected(builder()).await;
    peer.write_frame(0x8B, b"").await;
    assert!(matches!(
        session.receive_message().await,
        Err(ConnectionError::ProtocolViolation("Unhandled opcode"))
    ));
}

#[tokio::test]
async fn invalid_utf8_text_is_a_violation() {
    let (mut session, mut peer) = connected(builder()).await;
    peer.write_frame(0x81, &[0xFF, 0xFE]).await;
    assert!(matches!(
        session.receive_message().await,
        Err(ConnectionError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn close_completes_when_peer_answers() {
    let (mut session, mut peer) = connected(builder()).await;
    let server = async {
        let (first, payload) = peer.read_frame().await;
        assert_eq!(first, 0x88);
        assert_eq!(payload, 1000u16.to_be_bytes());
        peer.write_frame(0x88, &payload).await;
    };
    let (closed, ()) = tokio::join!(session.close(), server);
    closed.unwrap();
    assert_eq!(session.state(), ConnectionState::Finished);
    assert_eq!(
        session.close_reason(),
        Some((CloseReason::NormalClosure, ""))
    );

    assert!(matches!(
        session.send_text("late").await,
        Err(ConnectionError::NotConnected(ConnectionState::Finished))
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn close_times_out_without_answer() {
    let (mut session, mut peer) = connected(builder().close_timeout(Duration::from_millis(50))).await;
    let started = tokio::time::Instant::now();
    let (closed, (first, _)) = tokio::join!(session.close(), peer.read_frame());
    closed.unwrap();
    assert_eq!(first, 0x88);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(session.state(), ConnectionState::Finished);
    assert_eq!(session.close_reason(), None);
}

#[tokio::test]
async fn peer_initiated_close_is_echoed() {
    let (mut session, mut peer) = connected(builder()).await;
    let mut payload = 1001u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"bye");
    peer.write_frame(0x88, &payload).await;

    assert_eq!(session.receive_message().await.unwrap(), None);
    assert_eq!(session.state(), ConnectionState::Finished);
    assert_eq!(session.close_reason(), Some((CloseReason::GoingAway, "bye")));
    assert_eq!(peer.read_frame().await, (0x88, 1001u16.to_be_bytes().to_vec()));
}

#[tokio::test]
async fn transport_loss_finishes_session() {
    let (mut session, peer) = connected(builder()).await;
    drop(peer);
    assert!(matches!(
        session.receive_message().await,
        Err(ConnectionError::Closed)
    ));
    assert_eq!(session.state(), ConnectionState::Finished);
}

#[tokio::test]
async fn operations_require_an_open_session() {
    let (mut session, _peer, attempts) = pair(builder());
    assert!(matches!(
        session.send_text("x").await,
        Err(ConnectionError::NotConnected(ConnectionState::Idle))
    ));
    assert!(matches!(
        session.receive_message().await,
        Err(ConnectionError::NotConnected(ConnectionState::Idle))
    ));
    assert!(matches!(
        session.ping(None).await,
        Err(ConnectionError::NotConnected(ConnectionState::Idle))
    ));
    assert!(matches!(
        session.close().await,
        Err(ConnectionError::NotConnected(ConnectionState::Idle))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn finished_session_cannot_reopen() {
    let (mut session, peer) = connected(builder()).await;
    drop(peer);
    let _ = session.receive_message().await;
    assert!(matches!(
        session.open(None).await,
        Err(ConnectionError::InvalidStateTransition {
            from: ConnectionState::Finished,
            to: ConnectionState::Connecting,
        })
    ));
}

#[test]
fn close_codes_map_both_ways() {
    assert_eq!(CloseReason::from(1000), CloseReason::NormalClosure);
    assert_eq!(CloseReason::from(4000), CloseReason::Other(4000));
    assert_eq!(u16::from(CloseReason::MessageTooBig), 1009);
    assert_eq!(u16::from(CloseReason::Other(3001)), 3001);
}

#[test]
fn close_payload_parsing() {
    assert_eq!(parse_close_payload(&[]).unwrap(), None);
    assert!(parse_close_payload(&[0x03]).is_err());
    assert_eq!(
        parse_close_payload(&[0x03, 0xE8, b'o', b'k']).unwrap(),
        Some((1000, "ok".to_owned()))
    );
}
