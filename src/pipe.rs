use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Why the duplex pipe stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Remote side closed or failed; `saw_bytes` is whether any remote
    /// byte reached the client during the session
    RemoteClosed { saw_bytes: bool },
    /// Client closed the WebSocket or the frame stream ended
    ClientClosed,
    /// Neither side produced traffic within the idle window
    IdleTimeout,
}

/// Copy bytes between the remote stream and the WebSocket in both
/// directions until one side ends.
///
/// The first remote chunk is delivered as `response_header || chunk` in a
/// single binary frame; `response_header` is consumed at that point and
/// stays consumed across a retry restart. Remote-side read and write
/// failures are reported through [`PipeEnd::RemoteClosed`] so the caller
/// can decide on the single retry; WebSocket failures are hard errors.
pub async fn run<S, R>(
    ws: &mut WebSocketStream<S>,
    remote: &mut R,
    response_header: &mut Option<[u8; 2]>,
    idle_timeout: Duration,
    log_prefix: &str,
) -> Result<PipeEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    // The header is still pending iff no remote byte has gone out yet
    let mut saw_bytes = response_header.is_none();

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            res = remote.read(&mut buf) => {
                match res {
                    Ok(0) => return Ok(PipeEnd::RemoteClosed { saw_bytes }),
                    Ok(n) => {
                        let frame = match response_header.take() {
                            Some(header) => {
                                let mut first = Vec::with_capacity(2 + n);
                                first.extend_from_slice(&header);
                                first.extend_from_slice(&buf[..n]);
                                first
                            }
                            None => buf[..n].to_vec(),
                        };
                        ws.send(Message::Binary(frame))
                            .await
                            .map_err(|e| eyre!("{} client send failed: {}", log_prefix, e))?;
                        saw_bytes = true;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        warn!("{} remote read error: {}", log_prefix, e);
                        return Ok(PipeEnd::RemoteClosed { saw_bytes });
                    }
                }
            }
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = remote.write_all(&data).await {
                            warn!("{} remote write error: {}", log_prefix, e);
                            return Ok(PipeEnd::RemoteClosed { saw_bytes });
                        }
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(PipeEnd::ClientClosed),
                    // Control and text frames are not payload
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(eyre!("{} client receive failed: {}", log_prefix, e));
                    }
                }
            }
            _ = &mut idle => {
                debug!("{} idle for {:?}, closing", log_prefix, idle_timeout);
                return Ok(PipeEnd::IdleTimeout);
            }
        }
    }
}

/// Close the WebSocket without surfacing close-time failures.
///
/// Valid on a socket in any state, including one the peer already closed.
pub async fn safe_close<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{accept_async, client_async};

    type DuplexWs = WebSocketStream<tokio::io::DuplexStream>;

    /// Handshake a client/server WebSocket pair over an in-memory duplex
    async fn ws_pair() -> (DuplexWs, DuplexWs) {
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(accept_async(server_io));
        let request = "ws://gateway.invalid/".into_client_request().unwrap();
        let (client, _) = client_async(request, client_io).await.unwrap();
        let server = server.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_header_prefixes_first_frame_only() {
        let (mut client, mut server) = ws_pair().await;
        let (mut remote, mut far) = duplex(4096);

        let pipe_task = tokio::spawn(async move {
            let mut header = Some([0x00, 0x00]);
            let end = run(
                &mut server,
                &mut remote,
                &mut header,
                Duration::from_secs(5),
                "[test]",
            )
            .await
            .unwrap();
            (end, header)
        });

        far.write_all(b"hi").await.unwrap();
        far.write_all(b" there").await.unwrap();
        far.shutdown().await.unwrap();

        let (end, header) = pipe_task.await.unwrap();
        assert_eq!(end, PipeEnd::RemoteClosed { saw_bytes: true });
        assert!(header.is_none());

        // Chunk boundaries are not guaranteed; collect every frame and
        // check the header appears exactly once, at the front
        let mut body = Vec::new();
        let mut frames = 0;
        while let Ok(Some(Ok(msg))) =
            tokio::time::timeout(Duration::from_millis(200), client.next()).await
        {
            if msg.is_binary() {
                let data = msg.into_data();
                if frames == 0 {
                    assert_eq!(&data[..2], &[0x00, 0x00]);
                    body.extend_from_slice(&data[2..]);
                } else {
                    body.extend_from_slice(&data);
                }
                frames += 1;
            }
        }
        assert!(frames >= 1);
        assert_eq!(body, b"hi there");
    }

    #[tokio::test]
    async fn test_client_bytes_reach_remote_in_order() {
        let (mut client, mut server) = ws_pair().await;
        let (mut remote, mut far) = duplex(4096);

        let pipe_task = tokio::spawn(async move {
            let mut header = Some([0x00, 0x00]);
            run(
                &mut server,
                &mut remote,
                &mut header,
                Duration::from_secs(5),
                "[test]",
            )
            .await
            .unwrap()
        });

        client
            .send(Message::Binary(b"first".to_vec()))
            .await
            .unwrap();
        client
            .send(Message::Binary(b"-second".to_vec()))
            .await
            .unwrap();

        let mut received = vec![0u8; 12];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"first-second");

        client.close(None).await.unwrap();
        assert_eq!(pipe_task.await.unwrap(), PipeEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_remote_eof_without_bytes_reports_idle_upstream() {
        let (_client, mut server) = ws_pair().await;
        let (mut remote, far) = duplex(4096);
        drop(far); // remote closes immediately, nothing sent

        let mut header = Some([0x00, 0x00]);
        let end = run(
            &mut server,
            &mut remote,
            &mut header,
            Duration::from_secs(5),
            "[test]",
        )
        .await
        .unwrap();

        assert_eq!(end, PipeEnd::RemoteClosed { saw_bytes: false });
        // Header was never emitted
        assert!(header.is_some());
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_pipe() {
        let (_client, mut server) = ws_pair().await;
        let (mut remote, _far) = duplex(4096);

        let mut header = Some([0x00, 0x00]);
        let end = run(
            &mut server,
            &mut remote,
            &mut header,
            Duration::from_millis(20),
            "[test]",
        )
        .await
        .unwrap();
        assert_eq!(end, PipeEnd::IdleTimeout);
    }

    #[tokio::test]
    async fn test_safe_close_is_idempotent() {
        let (mut client, mut server) = ws_pair().await;
        safe_close(&mut server).await;
        safe_close(&mut server).await;
        // The peer observes a clean close
        while let Some(msg) = client.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
        safe_close(&mut client).await;
        safe_close(&mut client).await;
    }
}
