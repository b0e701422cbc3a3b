//! # WebSocket Client
//!
//! Minimal client for the capture device: handshake, masked text/binary
//! sends, best-effort close, and just enough reading to answer server pings
//! and surface control messages.
//!
//! The stream is wrapped in a `BufReader`, which passes writes straight
//! through; the read buffer only ever holds server→client bytes. Frames are
//! cut out of a pending buffer, so a frame split across TCP segments is
//! reassembled without blocking the capture loop.

use futures_util::FutureExt;
use rand::RngCore;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TransportError;
use crate::wire::frame::{decode_frame, write_frame, Opcode, WireFrame};
use crate::wire::handshake::{build_upgrade_request, generate_key, parse_ws_url, read_upgrade_response, WsTarget};

/// Largest server frame the client accepts.
pub const MAX_INBOUND_PAYLOAD: usize = 1 << 20;

/// Longest possible header: two bytes, 64-bit length, mask key.
const MAX_FRAME_HEADER: usize = 14;

/// A message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<u16>),
}

pub struct WsClient<S> {
    stream: BufReader<S>,
    /// Server bytes that do not yet form a complete frame
    pending: Vec<u8>,
    closed: bool,
}

impl WsClient<TcpStream> {
    /// Connect and complete the opening handshake within `timeout`.
    ///
    /// Non-`ws://` URLs fail before any socket is opened. On handshake failure
    /// the socket is shut down before the error is returned.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let target = parse_ws_url(url)?;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(target.authority()))
            .await
            .map_err(|_| TransportError::LinkDown(format!("connect to {} timed out", target.authority())))?
            .map_err(|e| TransportError::LinkDown(format!("connect to {}: {e}", target.authority())))?;
        tcp.set_nodelay(true)?;

        let mut client = WsClient::new(tcp);
        let outcome = match tokio::time::timeout(timeout, client.handshake(&target)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HandshakeFailed("timed out".into())),
        };

        match outcome {
            Ok(()) => Ok(client),
            Err(e) => {
                let _ = client.stream.get_mut().shutdown().await;
                Err(e)
            }
        }
    }
}

impl<S> WsClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream. Call [`handshake`](Self::handshake) next.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            pending: Vec::new(),
            closed: false,
        }
    }

    pub async fn handshake(&mut self, target: &WsTarget) -> Result<(), TransportError> {
        let key = generate_key();
        let request = build_upgrade_request(target, &key);
        self.stream.write_all(request.as_bytes()).await.map_err(request_not_sent)?;
        self.stream.flush().await.map_err(request_not_sent)?;
        read_upgrade_response(&mut self.stream).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.send(Opcode::Binary, data).await
    }

    async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::LinkDown("connection already closed".into()));
        }

        let mut mask_key = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask_key);

        write_frame(&mut self.stream, opcode, payload, mask_key)
            .await
            .map_err(|e| TransportError::LinkDown(format!("send failed: {e}")))
    }

    /// Wait for the next data or close frame, answering pings on the way.
    pub async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            if let Some(frame) = self.take_frame()? {
                if let Some(inbound) = self.handle(frame).await? {
                    return Ok(inbound);
                }
                continue;
            }

            let n = {
                let buf = self.stream.fill_buf().await?;
                if buf.is_empty() {
                    return Err(TransportError::LinkDown("server closed the connection".into()));
                }
                self.pending.extend_from_slice(buf);
                buf.len()
            };
            self.stream.consume(n);
        }
    }

    /// Handle the next frame if all of it has already arrived; never waits
    /// for the server. Partial frames stay buffered until the next call.
    /// Pings are answered and do not surface.
    pub async fn poll_inbound(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            if let Some(frame) = self.take_frame()? {
                if let Some(inbound) = self.handle(frame).await? {
                    return Ok(Some(inbound));
                }
                continue;
            }

            let n = match self.stream.fill_buf().now_or_never() {
                None => return Ok(None),
                Some(Ok(buf)) if buf.is_empty() => {
                    return Err(TransportError::LinkDown("server closed the connection".into()));
                }
                Some(Ok(buf)) => {
                    self.pending.extend_from_slice(buf);
                    buf.len()
                }
                Some(Err(e)) => return Err(TransportError::Io(e)),
            };
            self.stream.consume(n);
        }
    }

    /// Split one complete frame off the front of the pending bytes.
    fn take_frame(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match decode_frame(&self.pending)? {
            Some((frame, used)) => {
                self.pending.drain(..used);
                if frame.payload.len() > MAX_INBOUND_PAYLOAD {
                    return Err(TransportError::Protocol(format!(
                        "frame of {} bytes exceeds limit of {MAX_INBOUND_PAYLOAD}",
                        frame.payload.len()
                    )));
                }
                Ok(Some(frame))
            }
            None if self.pending.len() > MAX_INBOUND_PAYLOAD + MAX_FRAME_HEADER => Err(TransportError::Protocol(
                format!("frame exceeds limit of {MAX_INBOUND_PAYLOAD}"),
            )),
            None => Ok(None),
        }
    }

    async fn handle(&mut self, frame: WireFrame) -> Result<Option<Inbound>, TransportError> {
        match frame.opcode {
            Opcode::Ping => {
                debug!(len = frame.payload.len(), "ping from server");
                self.send(Opcode::Pong, &frame.payload).await?;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Text => {
                let text = String::from_utf8(frame.payload)
                    .map_err(|_| TransportError::Protocol("text frame is not utf-8".into()))?;
                Ok(Some(Inbound::Text(text)))
            }
            Opcode::Binary => Ok(Some(Inbound::Binary(frame.payload))),
            Opcode::Close => {
                self.closed = true;
                Ok(Some(Inbound::Close(frame.close_code())))
            }
            Opcode::Continuation => Err(TransportError::Protocol(
                "fragmented frames are not supported".into(),
            )),
        }
    }

    /// Best-effort close frame, then unconditional shutdown. Never fails.
    pub async fn close(mut self) {
        if !self.closed {
            let _ = self.send(Opcode::Close, &[]).await;
            self.closed = true;
        }
        let _ = self.stream.get_mut().shutdown().await;
    }
}

fn request_not_sent(e: std::io::Error) -> TransportError {
    TransportError::HandshakeFailed(format!("request not sent: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::{encode_frame, read_frame};
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_tungstenite::tungstenite::Message;

    const OK_RESPONSE: &[u8] =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn target() -> WsTarget {
        parse_ws_url("ws://device-host/ws/audio?device=d1").unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_masked_frames() {
        let (client_io, mut server) = duplex(64 * 1024);
        let mut client = WsClient::new(client_io);

        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            server.write_all(OK_RESPONSE).await.unwrap();

            let text = read_frame(&mut server, 1 << 20).await.unwrap();
            let binary = read_frame(&mut server, 1 << 20).await.unwrap();
            let close = read_frame(&mut server, 1 << 20).await.unwrap();
            (request, text, binary, close)
        });

        client.handshake(&target()).await.unwrap();
        client.send_text(r#"{"type":"stop"}"#).await.unwrap();
        client.send_binary(&[7u8; 640]).await.unwrap();
        client.close().await;

        let (request, text, binary, close) = server_task.await.unwrap();
        assert!(request.starts_with("GET /ws/audio?device=d1 HTTP/1.1\r\n"));

        assert_eq!(text.opcode, Opcode::Text);
        assert!(text.mask_key.is_some());
        assert_eq!(text.payload, br#"{"type":"stop"}"#);

        assert_eq!(binary.opcode, Opcode::Binary);
        assert!(binary.mask_key.is_some());
        assert_eq!(binary.payload, vec![7u8; 640]);

        assert_eq!(close.opcode, Opcode::Close);
        assert!(close.payload.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let (client_io, mut server) = duplex(4096);
        let mut client = WsClient::new(client_io);

        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = client.handshake(&target()).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_ping_answered_and_text_surfaced() {
        let (client_io, mut server) = duplex(4096);
        let mut client = WsClient::new(client_io);

        let server_task = tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(OK_RESPONSE).await.unwrap();
            server.write_all(&encode_frame(Opcode::Ping, b"hb", None)).await.unwrap();
            server
                .write_all(&encode_frame(Opcode::Text, br#"{"type":"barge_in","reason":"user_speaking"}"#, None))
                .await
                .unwrap();
            let pong = read_frame(&mut server, 1024).await.unwrap();
            server.write_all(&encode_frame(Opcode::Close, &1000u16.to_be_bytes(), None)).await.unwrap();
            pong
        });

        client.handshake(&target()).await.unwrap();
        let msg = client.recv().await.unwrap();
        assert_eq!(msg, Inbound::Text(r#"{"type":"barge_in","reason":"user_speaking"}"#.into()));

        let pong = server_task.await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"hb");

        assert_eq!(client.recv().await.unwrap(), Inbound::Close(Some(1000)));
    }

    #[tokio::test]
    async fn test_poll_inbound_does_not_block() {
        let (client_io, mut server) = duplex(4096);
        let mut client = WsClient::new(client_io);

        let t = target();
        let handshake = async {
            read_request(&mut server).await;
            server.write_all(OK_RESPONSE).await.unwrap();
        };
        let (result, _) = tokio::join!(client.handshake(&t), handshake);
        result.unwrap();

        assert_eq!(client.poll_inbound().await.unwrap(), None);

        server.write_all(&encode_frame(Opcode::Text, b"hi", None)).await.unwrap();
        assert_eq!(client.poll_inbound().await.unwrap(), Some(Inbound::Text("hi".into())));

        drop(server);
        let err = client.poll_inbound().await.unwrap_err();
        assert!(matches!(err, TransportError::LinkDown(_)));
    }

    #[tokio::test]
    async fn test_poll_inbound_buffers_split_frames() {
        let (client_io, mut server) = duplex(4096);
        let mut client = WsClient::new(client_io);

        let t = target();
        let handshake = async {
            read_request(&mut server).await;
            server.write_all(OK_RESPONSE).await.unwrap();
        };
        let (result, _) = tokio::join!(client.handshake(&t), handshake);
        result.unwrap();

        let ping = encode_frame(Opcode::Ping, b"hb", None);
        let text = encode_frame(Opcode::Text, br#"{"type":"processing"}"#, None);

        // half a ping, then a ping tail glued to the head of a text frame
        server.write_all(&ping[..1]).await.unwrap();
        let polled = tokio::time::timeout(Duration::from_millis(200), client.poll_inbound()).await;
        assert_eq!(polled.expect("partial frame must not block").unwrap(), None);

        let mut rest = ping[1..].to_vec();
        rest.extend_from_slice(&text[..5]);
        server.write_all(&rest).await.unwrap();
        let polled = tokio::time::timeout(Duration::from_millis(200), client.poll_inbound()).await;
        assert_eq!(polled.expect("partial frame must not block").unwrap(), None);

        let pong = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"hb");

        server.write_all(&text[5..]).await.unwrap();
        assert_eq!(
            client.poll_inbound().await.unwrap(),
            Some(Inbound::Text(r#"{"type":"processing"}"#.into()))
        );
        assert_eq!(client.poll_inbound().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsupported_scheme_fails_before_connecting() {
        let err = WsClient::connect("wss://127.0.0.1:1/ws/audio", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn test_interoperates_with_tungstenite_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Ping(b"keepalive".to_vec())).await.unwrap();

            let mut received = Vec::new();
            while let Some(msg) = ws.next().await {
                match msg.unwrap() {
                    Message::Close(_) => break,
                    other => received.push(other),
                }
            }
            received
        });

        let url = format!("ws://{addr}/ws/audio?device=interop");
        let mut client = WsClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        let big = vec![0x5Au8; 70_000];
        client.send_text(r#"{"type":"start","sample_rate":16000,"bits":16,"channels":1}"#).await.unwrap();
        client.send_binary(&big).await.unwrap();

        // the server only sent a ping, which is answered without surfacing
        for _ in 0..40 {
            assert_eq!(client.poll_inbound().await.unwrap(), None);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client.close().await;

        let received = server.await.unwrap();
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], Message::Text(t) if t.contains("\"start\"")));
        assert!(matches!(&received[1], Message::Binary(b) if *b == big));
        assert!(matches!(&received[2], Message::Pong(p) if p == b"keepalive"));
    }
}
