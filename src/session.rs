use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use color_eyre::eyre::{eyre, Result, WrapErr};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dns::{self, DohClient};
use crate::outbound::Dispatcher;
use crate::pipe::{self, PipeEnd};
use crate::protocol::{self, Command, Request};

/// Global session counter for generating unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID.
///
/// The ID combines the lower 48 bits of nanoseconds since the UNIX epoch
/// with a monotonic counter, giving a compact lowercase hex string that
/// stays unique under high concurrency.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// Per-connection session state; owns the log prefix used by every line
/// this connection emits. The session id only ever appears inside the
/// prefix.
pub struct Session {
    pub prefix: String,
}

impl Session {
    fn new(request: &Request) -> Self {
        let id = new_session_id();
        let mode = match request.command {
            Command::Tcp => "tcp",
            Command::Udp => "udp",
        };
        let prefix = format!("[{}:{}-{} {}]", request.address, request.port, id, mode);
        Self { prefix }
    }
}

/// Drive one accepted WebSocket from header parse to teardown.
///
/// The first chunk is the decoded early data when present, otherwise the
/// first binary frame. The request header must arrive whole in that chunk;
/// short first chunks are rejected, not reassembled.
pub async fn handle<S>(
    mut ws: WebSocketStream<S>,
    early_data: Vec<u8>,
    config: Arc<GatewayConfig>,
    dispatcher: Arc<Dispatcher>,
    doh: Arc<DohClient>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first_chunk = if !early_data.is_empty() {
        early_data
    } else {
        match first_binary_frame(&mut ws).await? {
            Some(data) => data,
            // Client went away before sending a header
            None => return Ok(()),
        }
    };

    let request = match protocol::parse_request(&first_chunk, &config.users) {
        Ok(request) => request,
        Err(e) => {
            // Nothing informative goes back to the client
            pipe::safe_close(&mut ws).await;
            return Err(e).wrap_err("request rejected");
        }
    };

    let payload = request.payload(&first_chunk).to_vec();
    let session = Session::new(&request);
    debug!("{} accepted user {}", session.prefix, request.user);

    let mut response_header = Some(protocol::response_header(request.version));

    let result = match request.command {
        Command::Udp => {
            dns::run_session(&mut ws, &payload, &doh, response_header, &session.prefix)
                .await
                .map_err(|e| eyre!("{} dns relay failed: {}", session.prefix, e))
        }
        Command::Tcp => {
            run_tcp(
                &mut ws,
                &request,
                &payload,
                &mut response_header,
                &config,
                &dispatcher,
                &session,
            )
            .await
        }
    };

    pipe::safe_close(&mut ws).await;
    result
}

/// TCP branch: dial, flush the initial payload, run the pipe, and retry
/// through the secondary hop at most once if the primary never produced
/// a byte
async fn run_tcp<S>(
    ws: &mut WebSocketStream<S>,
    request: &Request,
    payload: &[u8],
    response_header: &mut Option<[u8; 2]>,
    config: &GatewayConfig,
    dispatcher: &Dispatcher,
    session: &Session,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut used_retry = false;

    let mut remote: TcpStream =
        match dispatcher.connect_primary(&request.address, request.port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{} primary dial failed: {:#}", session.prefix, e);
                used_retry = true;
                let target = dispatcher.retry_target(&request.address, request.port);
                info!("{} retrying via {}", session.prefix, target);
                dispatcher.connect_retry(&target).await?
            }
        };

    loop {
        if let Err(e) = remote.write_all(payload).await {
            warn!("{} initial payload write failed: {}", session.prefix, e);
            if used_retry {
                return Err(e).wrap_err("retry stream failed");
            }
            used_retry = true;
            let target = dispatcher.retry_target(&request.address, request.port);
            info!("{} retrying via {}", session.prefix, target);
            remote = dispatcher.connect_retry(&target).await?;
            continue;
        }

        let end = pipe::run(
            ws,
            &mut remote,
            response_header,
            config.idle_timeout,
            &session.prefix,
        )
        .await?;

        match end {
            PipeEnd::RemoteClosed { saw_bytes: false } if !used_retry => {
                used_retry = true;
                let target = dispatcher.retry_target(&request.address, request.port);
                info!(
                    "{} no data from primary, retrying via {}",
                    session.prefix, target
                );
                remote = dispatcher.connect_retry(&target).await?;
            }
            end => {
                debug!("{} closed ({:?})", session.prefix, end);
                return Ok(());
            }
        }
    }
}

async fn first_binary_frame<S>(ws: &mut WebSocketStream<S>) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws.next().await {
        match message.wrap_err("client receive failed")? {
            Message::Binary(data) => return Ok(Some(data)),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}
