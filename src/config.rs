use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use uuid::Uuid;

use crate::auth::Auth;
use crate::socks::Socks5Endpoint;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "VLESS-over-WebSocket proxy gateway",
    long_about = "wsvless terminates VLESS sessions carried over WebSocket and relays them \
to TCP endpoints or a DNS-over-HTTPS resolver.\n\nFeatures:\n\
- UUID-based client authentication (comma-separated accepted set)\n\
- Early data in the Sec-WebSocket-Protocol header\n\
- Optional upstream SOCKS5 hop, per-retry or for all outbound traffic\n\
- UDP port 53 relayed to a DoH resolver\n\
- Connect and idle timeouts\n"
)]
pub struct Cli {
    /// Listen address for WebSocket clients
    #[arg(long, env = "WSVLESS_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Comma-separated accepted user UUIDs
    #[arg(
        long = "user-id",
        env = "WSVLESS_USER_ID",
        value_delimiter = ',',
        required = true
    )]
    pub user_id: Vec<Uuid>,

    /// Secondary hop (host:port) dialed when the primary destination
    /// yields no data
    #[arg(long, env = "WSVLESS_FALLBACK", value_name = "HOST:PORT")]
    pub fallback: Option<String>,

    /// Upstream SOCKS5 endpoint ([user:pass@]host:port)
    #[arg(long, env = "WSVLESS_SOCKS5", value_name = "[USER:PASS@]HOST:PORT")]
    pub socks5: Option<String>,

    /// Route every outbound connection through the SOCKS5 endpoint
    #[arg(long, env = "WSVLESS_SOCKS5_RELAY_ALL", default_value_t = false)]
    pub socks5_relay_all: bool,

    /// DNS-over-HTTPS resolver receiving UDP port 53 traffic
    #[arg(
        long,
        env = "WSVLESS_DOH_URL",
        default_value = "https://1.1.1.1/dns-query"
    )]
    pub doh_url: String,

    /// Outbound connect timeout in seconds
    #[arg(long, env = "WSVLESS_CONNECT_TIMEOUT", default_value_t = 8)]
    pub connect_timeout: u64,

    /// Idle timeout in seconds for established sessions
    #[arg(long, env = "WSVLESS_IDLE_TIMEOUT", default_value_t = 540)]
    pub idle_timeout: u64,

    /// Per-query DoH request timeout in seconds
    #[arg(long, env = "WSVLESS_DOH_TIMEOUT", default_value_t = 5)]
    pub doh_timeout: u64,
}

/// Gateway configuration derived from CLI arguments, immutable per process
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub users: Vec<Uuid>,
    pub fallback: Option<(String, u16)>,
    pub socks5: Option<Socks5Endpoint>,
    pub socks5_relay_all: bool,
    pub doh_url: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub doh_timeout: Duration,
}

impl GatewayConfig {
    /// Create GatewayConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Result<Self> {
        if args.user_id.is_empty() {
            return Err(eyre!("at least one --user-id is required"));
        }

        let fallback = args
            .fallback
            .as_deref()
            .map(parse_host_port)
            .transpose()
            .map_err(|e| eyre!("invalid --fallback: {}", e))?;

        let socks5 = args
            .socks5
            .as_deref()
            .map(parse_socks5_endpoint)
            .transpose()
            .map_err(|e| eyre!("invalid --socks5: {}", e))?;

        if args.socks5_relay_all && socks5.is_none() {
            return Err(eyre!("--socks5-relay-all requires --socks5"));
        }

        Ok(Self {
            listen_addr: args.listen,
            users: args.user_id,
            fallback,
            socks5,
            socks5_relay_all: args.socks5_relay_all,
            doh_url: args.doh_url,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            doh_timeout: Duration::from_secs(args.doh_timeout),
        })
    }
}

/// Parse `host:port`; brackets around an IPv6 host are stripped
fn parse_host_port(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in {:?}", s))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("empty host in {:?}", s));
    }
    Ok((host.to_string(), port))
}

/// Parse `[user:pass@]host:port` into a SOCKS5 endpoint
fn parse_socks5_endpoint(s: &str) -> Result<Socks5Endpoint, String> {
    let (auth, hostport) = match s.rsplit_once('@') {
        Some((credentials, rest)) => {
            let (user, pass) = credentials
                .split_once(':')
                .ok_or_else(|| format!("expected user:pass before '@' in {:?}", s))?;
            if user.is_empty() {
                return Err(format!("empty username in {:?}", s));
            }
            (
                Some(Auth::new(user.to_string(), pass.to_string())),
                rest,
            )
        }
        None => (None, s),
    };

    let (host, port) = parse_host_port(hostport)?;
    Ok(Socks5Endpoint { host, port, auth })
}

/// Baseline configuration for unit tests
#[cfg(test)]
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        users: vec!["10e894da-61b1-4998-ac2b-e9ccb6af9d30".parse().unwrap()],
        fallback: None,
        socks5: None,
        socks5_relay_all: false,
        doh_url: "https://1.1.1.1/dns-query".to_string(),
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        doh_timeout: Duration::from_secs(2),
    }
}
