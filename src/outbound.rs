use std::fmt;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result, WrapErr};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::GatewayConfig;
use crate::protocol::Address;
use crate::socks::SocksConnector;

/// Where the dispatcher goes when the primary connection yields no data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTarget {
    /// Original destination through the upstream SOCKS5 server
    Socks { address: Address, port: u16 },
    /// Configured secondary hop, dialed directly
    Fallback { host: String, port: u16 },
    /// Original destination again, dialed directly
    Direct { address: Address, port: u16 },
}

impl fmt::Display for RetryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryTarget::Socks { address, port } => {
                write!(f, "socks5 {}:{}", address, port)
            }
            RetryTarget::Fallback { host, port } => write!(f, "fallback {}:{}", host, port),
            RetryTarget::Direct { address, port } => write!(f, "direct {}:{}", address, port),
        }
    }
}

/// Opens outbound TCP streams for sessions, directly or through the
/// configured SOCKS5 upstream
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    socks: Option<SocksConnector>,
}

impl Dispatcher {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let socks = config
            .socks5
            .clone()
            .map(|endpoint| SocksConnector::new(endpoint, config.connect_timeout));
        Self { config, socks }
    }

    /// Open the primary outbound stream to the requested destination
    pub async fn connect_primary(&self, address: &Address, port: u16) -> Result<TcpStream> {
        if self.config.socks5_relay_all {
            let socks = self
                .socks
                .as_ref()
                .ok_or_else(|| eyre!("socks5-relay-all set without a SOCKS5 endpoint"))?;
            return socks
                .connect(address, port)
                .await
                .wrap_err_with(|| format!("SOCKS5 connect to {}:{} failed", address, port));
        }
        self.direct_connect(&address.to_string(), port).await
    }

    /// The single retry hop for this destination.
    ///
    /// A configured SOCKS5 endpoint wins over the fallback host; with
    /// neither configured the original destination is dialed again.
    pub fn retry_target(&self, address: &Address, port: u16) -> RetryTarget {
        if self.socks.is_some() {
            return RetryTarget::Socks {
                address: address.clone(),
                port,
            };
        }
        if let Some((host, fallback_port)) = &self.config.fallback {
            return RetryTarget::Fallback {
                host: host.clone(),
                port: *fallback_port,
            };
        }
        RetryTarget::Direct {
            address: address.clone(),
            port,
        }
    }

    /// Open the retry stream; callers invoke this at most once per session
    pub async fn connect_retry(&self, target: &RetryTarget) -> Result<TcpStream> {
        match target {
            RetryTarget::Socks { address, port } => {
                let socks = self
                    .socks
                    .as_ref()
                    .ok_or_else(|| eyre!("retry requested SOCKS5 without an endpoint"))?;
                socks
                    .connect(address, *port)
                    .await
                    .wrap_err_with(|| format!("SOCKS5 retry to {}:{} failed", address, port))
            }
            RetryTarget::Fallback { host, port } => self.direct_connect(host, *port).await,
            RetryTarget::Direct { address, port } => {
                self.direct_connect(&address.to_string(), *port).await
            }
        }
    }

    async fn direct_connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| eyre!("connect to {}:{} timed out", host, port))?
            .wrap_err_with(|| format!("connect to {}:{} failed", host, port))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
