use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Error type for DNS-over-HTTPS queries
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("DoH request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DoH server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("DoH reply of {0} bytes does not fit a 16-bit length prefix")]
    ReplyTooLarge(usize),
}

/// Splits a stream of byte chunks into length-prefixed DNS packets.
///
/// A chunk may contain several concatenated packets or end mid-packet;
/// partial data is buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct PacketSplitter {
    buf: BytesMut,
}

impl PacketSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the client
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete packet, if one is buffered
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).to_vec())
    }

    /// Bytes buffered but not yet forming a complete packet
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// DNS-over-HTTPS client, one pooled HTTP client per process
#[derive(Debug, Clone)]
pub struct DohClient {
    url: String,
    client: reqwest::Client,
}

impl DohClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { url, client })
    }

    /// POST one DNS query in RFC 8484 wire format and return the reply body
    pub async fn query(&self, packet: Vec<u8>) -> Result<Vec<u8>, DnsError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/dns-message")
            .header("Accept", "application/dns-message")
            .body(packet)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DnsError::Status(response.status()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Relay UDP-framed DNS queries from the WebSocket to the DoH resolver.
///
/// Each reply goes back as one binary frame carrying a 16-bit big-endian
/// length prefix; the first frame additionally carries the two-byte
/// response header. A failed query is logged and skipped, the session
/// keeps serving later queries.
pub async fn run_session<S>(
    ws: &mut WebSocketStream<S>,
    first_chunk: &[u8],
    doh: &DohClient,
    mut response_header: Option<[u8; 2]>,
    log_prefix: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut splitter = PacketSplitter::new();
    splitter.push(first_chunk);
    resolve_buffered(ws, &mut splitter, doh, &mut response_header, log_prefix).await?;

    while let Some(message) = ws.next().await {
        match message? {
            Message::Binary(data) => {
                splitter.push(&data);
                resolve_buffered(ws, &mut splitter, doh, &mut response_header, log_prefix)
                    .await?;
            }
            Message::Close(_) => break,
            // Control and text frames carry no DNS payload
            _ => {}
        }
    }
    Ok(())
}

async fn resolve_buffered<S>(
    ws: &mut WebSocketStream<S>,
    splitter: &mut PacketSplitter,
    doh: &DohClient,
    response_header: &mut Option<[u8; 2]>,
    log_prefix: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(packet) = splitter.next_packet() {
        let query_len = packet.len();
        match resolve_one(doh, packet).await {
            Ok(body) if body.is_empty() => {
                debug!("{} empty reply skipped", log_prefix);
            }
            Ok(body) => {
                debug!(
                    "{} resolved {} byte query, {} byte reply",
                    log_prefix,
                    query_len,
                    body.len()
                );
                ws.send(Message::Binary(frame_reply(response_header.take(), &body)))
                    .await?;
            }
            Err(e) => {
                // DNS is idempotent, the client will retry
                warn!("{} query dropped: {}", log_prefix, e);
            }
        }
    }
    Ok(())
}

async fn resolve_one(doh: &DohClient, packet: Vec<u8>) -> Result<Vec<u8>, DnsError> {
    let body = doh.query(packet).await?;
    if body.len() > u16::MAX as usize {
        return Err(DnsError::ReplyTooLarge(body.len()));
    }
    Ok(body)
}

/// Frame one reply: optional response header, 16-bit big-endian length, body
fn frame_reply(response_header: Option<[u8; 2]>, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + 2 + body.len());
    if let Some(header) = response_header {
        frame.extend_from_slice(&header);
    }
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}
