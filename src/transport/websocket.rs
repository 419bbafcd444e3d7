//! Socket transport: WebSocket upgrade handshake and framing
//!
//! Implements the minimal subset of the upgrade protocol ClipLink needs:
//! a `101 Switching Protocols` handshake with the standard accept token,
//! and text/binary frame encode/decode with 7/16/64-bit lengths and client
//! masking. The server hands inbound binary payloads to the coordinator as
//! opaque bytes and, when acting as a relay hub, rebroadcasts them to every
//! connected peer except the originator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FrameTransport, Result, TransportError};

/// Fixed GUID appended to the client key when computing the accept token
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest frame accepted or produced on the socket channel
pub const WS_MAX_FRAME: usize = crate::MAX_PAYLOAD_SIZE;

const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Compute `Base64(SHA-1(key || GUID))` for the handshake response
pub fn accept_key(client_key: &str) -> String {
    let digest = ring::digest::digest(
        &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        format!("{client_key}{WS_GUID}").as_bytes(),
    );
    STANDARD.encode(digest.as_ref())
}

/// Parsed upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

/// Validate an upgrade request's method/version line and header pair,
/// extracting the client-supplied key
pub fn parse_upgrade_request(raw: &str) -> Result<UpgradeRequest> {
    let mut lines = raw.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| TransportError::Handshake("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if method != "GET" || !version.starts_with("HTTP/1.1") {
        return Err(TransportError::Handshake(format!(
            "unsupported request line: {request_line}"
        )));
    }

    let mut upgrade = None;
    let mut connection = None;
    let mut key = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "upgrade" => upgrade = Some(value.to_string()),
                "connection" => connection = Some(value.to_string()),
                "sec-websocket-key" => key = Some(value.to_string()),
                _ => {}
            }
        }
    }

    match upgrade {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(TransportError::Handshake("missing Upgrade: websocket".into())),
    }
    match connection {
        Some(v) if v.to_ascii_lowercase().contains("upgrade") => {}
        _ => {
            return Err(TransportError::Handshake(
                "Connection header does not request upgrade".into(),
            ))
        }
    }
    let key = key.ok_or_else(|| TransportError::Handshake("missing Sec-WebSocket-Key".into()))?;

    Ok(UpgradeRequest {
        path: path.to_string(),
        key,
    })
}

/// Build the `101 Switching Protocols` response for a client key
pub fn upgrade_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// Frame opcodes ClipLink understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(TransportError::Handshake(format!(
                "unsupported opcode {other:#x}"
            ))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl WsFrame {
    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload,
        }
    }
}

/// Encode a frame; clients must supply a masking key, servers never do
pub fn encode_frame(frame: &WsFrame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let byte0 = if frame.fin { 0x80 } else { 0x00 } | frame.opcode.bits();
    out.push(byte0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(
                frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ key[i % 4]),
            );
        }
        None => out.extend_from_slice(&frame.payload),
    }
    out
}

/// Decode one frame from the front of `buf`
///
/// Returns `None` when more bytes are needed; `Some((frame, consumed))`
/// otherwise. Masked payloads are unmasked.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(WsFrame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;

    let (payload_len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(be) as usize, 10)
        }
        n => (n, 2),
    };

    if payload_len > WS_MAX_FRAME {
        return Err(TransportError::Handshake(format!(
            "frame of {payload_len} bytes exceeds limit"
        )));
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(Some((
        WsFrame {
            fin,
            opcode,
            payload,
        },
        offset + payload_len,
    )))
}

/// Generate a random client masking key
pub fn client_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Bounded exponential backoff for socket reconnects
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based); `None` once the budget is
    /// exhausted
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(
            delay.min(self.max_delay.as_secs_f64()),
        ))
    }
}

type PeerWriters = Arc<RwLock<HashMap<Uuid, mpsc::Sender<WsFrame>>>>;

/// Accepting side of the socket channel
///
/// Performs the upgrade handshake for each incoming connection, decodes
/// frames, hands binary payloads to the coordinator, and optionally relays
/// them to every other connected peer.
pub struct WebSocketServer {
    listener: TcpListener,
    peers: PeerWriters,
    inbound: mpsc::Sender<Bytes>,
    relay: bool,
    shutdown: watch::Sender<bool>,
}

impl WebSocketServer {
    pub async fn bind(addr: &str, inbound: mpsc::Sender<Bytes>, relay: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Socket transport listening");
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound,
            relay,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the connected-peer writer table, shared with the
    /// outbound transport
    pub fn peers(&self) -> PeerWriters {
        Arc::clone(&self.peers)
    }

    /// Signal used by [`WebSocketTransport::close`]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Accept loop; runs until the shutdown signal flips
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Socket transport shutting down");
                    self.peers.write().await.clear();
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(%addr, "Incoming socket connection");
                    let peers = Arc::clone(&self.peers);
                    let inbound = self.inbound.clone();
                    let relay = self.relay;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peers, inbound, relay).await {
                            warn!(%addr, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peers: PeerWriters,
    inbound: mpsc::Sender<Bytes>,
    relay: bool,
) -> Result<()> {
    let request = read_upgrade_request(&mut stream).await?;
    let upgrade = match parse_upgrade_request(&request) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                .await;
            return Err(e);
        }
    };
    stream
        .write_all(upgrade_response(&upgrade.key).as_bytes())
        .await?;

    let peer_id = Uuid::new_v4();
    let (writer_tx, mut writer_rx) = mpsc::channel::<WsFrame>(64);
    peers.write().await.insert(peer_id, writer_tx);
    info!(%peer_id, "Peer connected");

    let (mut reader, mut writer) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            let encoded = encode_frame(&frame, None);
            if writer.write_all(&encoded).await.is_err() {
                break;
            }
        }
    });

    let mut buf = Vec::new();
    let mut read_buf = [0u8; 4096];
    let mut peer_closed = false;
    let result = loop {
        if peer_closed {
            break Ok(());
        }
        match reader.read(&mut read_buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                buf.extend_from_slice(&read_buf[..n]);
                while !peer_closed {
                    match decode_frame(&buf) {
                        Ok(Some((frame, consumed))) => {
                            buf.drain(..consumed);
                            match frame.opcode {
                                Opcode::Binary | Opcode::Text => {
                                    let payload = Bytes::from(frame.payload);
                                    if relay {
                                        relay_to_others(&peers, peer_id, &payload).await;
                                    }
                                    if inbound.send(payload).await.is_err() {
                                        peer_closed = true;
                                    }
                                }
                                Opcode::Ping => {
                                    let pong = WsFrame {
                                        fin: true,
                                        opcode: Opcode::Pong,
                                        payload: frame.payload,
                                    };
                                    if let Some(tx) = peers.read().await.get(&peer_id) {
                                        let _ = tx.send(pong).await;
                                    }
                                }
                                Opcode::Pong => {}
                                Opcode::Close => peer_closed = true,
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Malformed input is dropped, never panicked on
                            warn!(%peer_id, error = %e, "Closing undecodable frame stream");
                            peer_closed = true;
                        }
                    }
                }
            }
            Err(e) => break Err(TransportError::from(e)),
        }
    };

    peers.write().await.remove(&peer_id);
    write_task.abort();
    info!(%peer_id, "Peer disconnected");
    result
}

async fn relay_to_others(peers: &PeerWriters, origin: Uuid, payload: &Bytes) {
    let peers = peers.read().await;
    for (peer_id, tx) in peers.iter() {
        if *peer_id == origin {
            continue;
        }
        if tx.send(WsFrame::binary(payload.to_vec())).await.is_err() {
            debug!(%peer_id, "Relay target gone");
        }
    }
}

async fn read_upgrade_request(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 256];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::Handshake(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&byte[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(TransportError::Handshake("request too large".into()));
        }
    }
    String::from_utf8(buf).map_err(|_| TransportError::Handshake("request not UTF-8".into()))
}

/// Outbound side of the socket channel: broadcasts encrypted frames to
/// every connected peer
pub struct WebSocketTransport {
    peers: PeerWriters,
    shutdown: watch::Sender<bool>,
}

impl WebSocketTransport {
    pub fn new(server: &WebSocketServer) -> Self {
        Self {
            peers: server.peers(),
            shutdown: server.shutdown_handle(),
        }
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    fn mtu(&self) -> usize {
        WS_MAX_FRAME
    }

    async fn send_frames(&self, frames: Vec<Bytes>) -> Result<()> {
        let peers = self.peers.read().await;
        for frame in &frames {
            for (peer_id, tx) in peers.iter() {
                if tx.send(WsFrame::binary(frame.to_vec())).await.is_err() {
                    debug!(%peer_id, "Send to disconnected peer skipped");
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // Known vector from the protocol specification
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_valid_upgrade_request() {
        let raw = "GET /sync HTTP/1.1\r\n\
                   Host: example\r\n\
                   Upgrade: websocket\r\n\
                   Connection: keep-alive, Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let upgrade = parse_upgrade_request(raw).unwrap();
        assert_eq!(upgrade.path, "/sync");
        assert_eq!(upgrade.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn test_parse_rejects_missing_upgrade_header() {
        let raw = "GET / HTTP/1.1\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: abc\r\n\r\n";
        assert!(parse_upgrade_request(raw).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_method() {
        let raw = "POST / HTTP/1.1\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: abc\r\n\r\n";
        assert!(parse_upgrade_request(raw).is_err());
    }

    #[test]
    fn test_upgrade_response_contains_accept_token() {
        let response = upgrade_response("dGhlIHNhbXBsZSBub25jZQ==");
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_frame_roundtrip_unmasked() {
        let frame = WsFrame::binary(b"hello".to_vec());
        let encoded = encode_frame(&frame, None);
        let (decoded, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_frame_roundtrip_masked() {
        let frame = WsFrame::binary(b"masked payload".to_vec());
        let encoded = encode_frame(&frame, Some(client_mask()));
        let (decoded, _) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_extended_lengths() {
        // 16-bit length
        let frame = WsFrame::binary(vec![0xAB; 300]);
        let encoded = encode_frame(&frame, None);
        assert_eq!(encoded[1] & 0x7F, 126);
        let (decoded, _) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 300);

        // 64-bit length
        let frame = WsFrame::binary(vec![0xCD; 70_000]);
        let encoded = encode_frame(&frame, None);
        assert_eq!(encoded[1] & 0x7F, 127);
        let (decoded, _) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 70_000);
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let frame = WsFrame::binary(vec![0xEF; 100]);
        let encoded = encode_frame(&frame, None);
        assert!(decode_frame(&encoded[..1]).unwrap().is_none());
        assert!(decode_frame(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = encode_frame(&WsFrame::binary(b"first".to_vec()), None);
        let b = encode_frame(&WsFrame::binary(b"second".to_vec()), None);
        let mut buf = a.clone();
        buf.extend_from_slice(&b);

        let (first, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        let (second, _) = decode_frame(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(second.payload, b"second");
    }

    #[test]
    fn test_unsupported_opcode_rejected() {
        // Opcode 0x3 is reserved
        let buf = [0x83u8, 0x00];
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(6), None);

        let capped = ReconnectPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            multiplier: 3.0,
        };
        assert_eq!(capped.next_delay(2), Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_server_handshake_and_relay() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let server = WebSocketServer::bind("127.0.0.1:0", inbound_tx, true)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let server_task = tokio::spawn(server.run());

        // First client connects and completes the handshake
        let mut a = TcpStream::connect(addr).await.unwrap();
        client_handshake(&mut a).await;

        // Second client connects
        let mut b = TcpStream::connect(addr).await.unwrap();
        client_handshake(&mut b).await;

        // Client A sends a masked binary frame
        let frame = encode_frame(&WsFrame::binary(b"sealed".to_vec()), Some(client_mask()));
        a.write_all(&frame).await.unwrap();

        // The server hands the payload to the coordinator...
        let delivered = inbound_rx.recv().await.unwrap();
        assert_eq!(&delivered[..], b"sealed");

        // ...and relays it to client B, never back to A
        let mut buf = vec![0u8; 256];
        let n = b.read(&mut buf).await.unwrap();
        let (relayed, _) = decode_frame(&buf[..n]).unwrap().unwrap();
        assert_eq!(relayed.payload, b"sealed");

        let _ = shutdown.send(true);
        let _ = server_task.await;
    }

    async fn client_handshake(stream: &mut TcpStream) {
        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: test\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 101"));
    }
}
