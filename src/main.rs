mod auth;
mod config;
mod connection;
mod dns;
mod earlydata;
mod outbound;
mod pipe;
mod protocol;
mod session;
mod socks;

use crate::config::{Cli, GatewayConfig};
use crate::connection::ConnectionGuard;
use crate::dns::DohClient;
use crate::outbound::Dispatcher;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wsvless=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(GatewayConfig::from_cli(args)?);

    info!("VLESS WebSocket gateway listening on {}", config.listen_addr);
    info!("{} accepted user id(s)", config.users.len());
    if let Some(endpoint) = &config.socks5 {
        info!(
            "upstream SOCKS5: {}:{}{}",
            endpoint.host,
            endpoint.port,
            if config.socks5_relay_all {
                " (relaying all outbound)"
            } else {
                ""
            }
        );
    }
    if let Some((host, port)) = &config.fallback {
        info!("fallback hop: {}:{}", host, port);
    }
    info!("DoH resolver: {}", config.doh_url);

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)));
    let doh = Arc::new(
        DohClient::new(config.doh_url.clone(), config.doh_timeout)
            .wrap_err("failed to build DoH client")?,
    );

    let listener = TcpListener::bind(config.listen_addr).await?;

    // Graceful shutdown signal handling
    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");

        info!("Shutdown signal received");

        let active = ConnectionGuard::active_count();
        if active > 0 {
            info!("Waiting for {} sessions to close...", active);

            for i in 1..=30 {
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                let remaining = ConnectionGuard::active_count();

                if remaining == 0 {
                    info!("All sessions closed gracefully");
                    break;
                }

                if i % 5 == 0 {
                    info!("Still waiting for {} sessions... ({}/30s)", remaining, i);
                }
            }

            let final_count = ConnectionGuard::active_count();
            if final_count > 0 {
                warn!("Forced shutdown with {} sessions still active", final_count);
            }
        }
    };

    // Main server loop
    let server = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let config = Arc::clone(&config);
                    let dispatcher = Arc::clone(&dispatcher);
                    let doh = Arc::clone(&doh);

                    tokio::task::spawn(async move {
                        let _guard = ConnectionGuard::new();
                        if let Err(err) =
                            handle_client(stream, peer_addr, config, dispatcher, doh).await
                        {
                            debug!("session from {} ended with error: {:#}", peer_addr, err);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    };

    // Run the server until the shutdown signal is received
    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

/// Upgrade one accepted TCP connection to a WebSocket and hand it to the
/// session state machine.
///
/// The `Sec-WebSocket-Protocol` request header is captured as early data
/// and echoed in the handshake response so early-data clients complete
/// the upgrade.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<GatewayConfig>,
    dispatcher: Arc<Dispatcher>,
    doh: Arc<DohClient>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let mut early_header: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, mut response: Response| {
            if let Some(value) = request.headers().get("sec-websocket-protocol") {
                if let Ok(text) = value.to_str() {
                    early_header = Some(text.to_string());
                }
                response
                    .headers_mut()
                    .append("sec-websocket-protocol", value.clone());
            }
            Ok(response)
        },
    )
    .await
    .wrap_err_with(|| format!("WebSocket handshake with {} failed", peer_addr))?;

    let early_data = match earlydata::decode(early_header.as_deref()) {
        Ok(data) => data,
        Err(e) => {
            let mut ws = ws;
            pipe::safe_close(&mut ws).await;
            return Err(e).wrap_err("early data rejected");
        }
    };

    debug!(
        "accepted WebSocket from {} ({} early data bytes)",
        peer_addr,
        early_data.len()
    );

    session::handle(ws, early_data, config, dispatcher, doh).await
}
