use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::Auth;
use crate::protocol::Address;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Error type for SOCKS5 connection operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("server replied with version {0:#04x}, expected 0x05")]
    BadVersion(u8),

    #[error("server accepted none of the offered methods")]
    NoAcceptableMethods,

    #[error("server selected unknown method {0:#04x}")]
    UnknownMethod(u8),

    #[error("server requires username/password but none are configured")]
    AuthRequired,

    #[error("username/password rejected by server")]
    AuthRejected,

    #[error("username or password exceeds 255 bytes")]
    CredentialsTooLong,

    #[error("CONNECT rejected with reply code {0:#04x}")]
    ConnectFailed(u8),

    #[error("malformed bind address in CONNECT reply ({0:#04x})")]
    BadReplyAddress(u8),

    #[error("connect to SOCKS5 server timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Upstream SOCKS5 endpoint, parsed from `[user:pass@]host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Endpoint {
    pub host: String,
    pub port: u16,
    pub auth: Option<Auth>,
}

/// SOCKS5 connection manager
#[derive(Debug)]
pub struct SocksConnector {
    endpoint: Socks5Endpoint,
    connect_timeout: Duration,
}

impl SocksConnector {
    /// Create a new SOCKS5 connector
    pub fn new(endpoint: Socks5Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    /// Open a stream to `(target, port)` through the upstream SOCKS5 server.
    ///
    /// The returned stream is past the handshake and owned exclusively by
    /// the caller; both halves are free for the duplex copy.
    pub async fn connect(&self, target: &Address, port: u16) -> SocksResult<TcpStream> {
        let server = (self.endpoint.host.as_str(), self.endpoint.port);
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| SocksError::Timeout)??;
        stream.set_nodelay(true)?;

        handshake(&mut stream, self.endpoint.auth.as_ref(), target, port).await?;
        Ok(stream)
    }
}

/// Run the RFC 1928 client handshake on an established stream.
///
/// Both no-auth and username/password are offered; the server picks.
/// Destination encoding mirrors the request address type.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    auth: Option<&Auth>,
    target: &Address,
    port: u16,
) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USERPASS])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(choice[0]));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USERPASS => {
            let auth = auth.ok_or(SocksError::AuthRequired)?;
            negotiate_userpass(stream, auth).await?;
        }
        METHOD_NO_ACCEPTABLE => return Err(SocksError::NoAcceptableMethods),
        other => return Err(SocksError::UnknownMethod(other)),
    }

    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    write_target(&mut request, target, port);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    if reply[1] != 0x00 {
        return Err(SocksError::ConnectFailed(reply[1]));
    }

    // Drain BND.ADDR and BND.PORT so the stream starts at payload bytes
    match reply[3] {
        ATYP_IPV4 => {
            let mut bound = [0u8; 4 + 2];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut bound = vec![0u8; len as usize + 2];
            stream.read_exact(&mut bound).await?;
        }
        ATYP_IPV6 => {
            let mut bound = [0u8; 16 + 2];
            stream.read_exact(&mut bound).await?;
        }
        other => return Err(SocksError::BadReplyAddress(other)),
    }

    Ok(())
}

/// RFC 1929 username/password sub-negotiation
async fn negotiate_userpass<S>(stream: &mut S, auth: &Auth) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(SocksError::CredentialsTooLong);
    }

    let mut negotiation = Vec::with_capacity(3 + user.len() + pass.len());
    negotiation.push(AUTH_VERSION);
    negotiation.push(user.len() as u8);
    negotiation.extend_from_slice(user);
    negotiation.push(pass.len() as u8);
    negotiation.extend_from_slice(pass);
    stream.write_all(&negotiation).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(SocksError::AuthRejected);
    }
    Ok(())
}

fn write_target(buf: &mut Vec<u8>, target: &Address, port: u16) {
    match target {
        Address::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(name) => {
            buf.push(ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }
        Address::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    /// Drive `handshake` against a scripted method-selection reply. The
    /// mock server answers any CONNECT with success and records every byte
    /// the client sent.
    async fn run_handshake(
        method_reply: Vec<u8>,
        auth: Option<Auth>,
        target: Address,
        port: u16,
    ) -> (SocksResult<()>, Vec<u8>) {
        let (mut client, mut server) = duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            seen.extend_from_slice(&greeting);
            server.write_all(&method_reply).await.unwrap();

            let mut rest = vec![0u8; 4096];
            loop {
                match server.read(&mut rest).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        seen.extend_from_slice(&rest[..n]);
                        if rest[..n].starts_with(&[SOCKS_VERSION, CMD_CONNECT]) {
                            let ok = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
                            server.write_all(&ok).await.unwrap();
                        }
                    }
                }
            }
            seen
        });

        let result = handshake(&mut client, auth.as_ref(), &target, port).await;
        drop(client);
        let seen = server_task.await.unwrap();
        (result, seen)
    }

    #[tokio::test]
    async fn test_no_auth_connect_succeeds() {
        let (result, seen) = run_handshake(
            vec![SOCKS_VERSION, METHOD_NO_AUTH],
            None,
            Address::V4(Ipv4Addr::new(1, 2, 3, 4)),
            443,
        )
        .await;

        result.unwrap();
        // Greeting offered both methods
        assert_eq!(
            &seen[..4],
            &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USERPASS]
        );
        // CONNECT mirrored the IPv4 address type with a big-endian port
        assert_eq!(
            &seen[4..],
            &[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 1, 2, 3, 4, 0x01, 0xbb]
        );
    }

    #[tokio::test]
    async fn test_domain_target_uses_domain_atyp() {
        let (result, seen) = run_handshake(
            vec![SOCKS_VERSION, METHOD_NO_AUTH],
            None,
            Address::Domain("example.com".to_string()),
            80,
        )
        .await;

        result.unwrap();
        let connect = &seen[4..];
        assert_eq!(&connect[..3], &[SOCKS_VERSION, CMD_CONNECT, 0x00]);
        assert_eq!(connect[3], ATYP_DOMAIN);
        assert_eq!(connect[4] as usize, "example.com".len());
        assert_eq!(&connect[5..16], b"example.com");
        assert_eq!(&connect[16..18], &80u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_ipv6_target_uses_ipv6_atyp() {
        let ip: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let (result, seen) = run_handshake(
            vec![SOCKS_VERSION, METHOD_NO_AUTH],
            None,
            Address::V6(ip),
            443,
        )
        .await;

        result.unwrap();
        let connect = &seen[4..];
        assert_eq!(connect[3], ATYP_IPV6);
        assert_eq!(&connect[4..20], &ip.octets());
    }

    #[tokio::test]
    async fn test_userpass_negotiation() {
        let (mut client, mut server) = duplex(4096);
        let auth = Auth::new("user".to_string(), "pass".to_string());
        let target = Address::V4(Ipv4Addr::new(10, 0, 0, 1));

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[SOCKS_VERSION, METHOD_USERPASS])
                .await
                .unwrap();

            let mut header = [0u8; 2];
            server.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], AUTH_VERSION);
            let mut user = vec![0u8; header[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            let pass_len = server.read_u8().await.unwrap();
            let mut pass = vec![0u8; pass_len as usize];
            server.read_exact(&mut pass).await.unwrap();
            assert_eq!(user, b"user");
            assert_eq!(pass, b"pass");
            server.write_all(&[AUTH_VERSION, 0x00]).await.unwrap();

            let mut connect = vec![0u8; 10];
            server.read_exact(&mut connect).await.unwrap();
            let ok = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
            server.write_all(&ok).await.unwrap();
        });

        handshake(&mut client, Some(&auth), &target, 443)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_acceptable_methods() {
        let (result, _) = run_handshake(
            vec![SOCKS_VERSION, METHOD_NO_ACCEPTABLE],
            None,
            Address::V4(Ipv4Addr::new(1, 2, 3, 4)),
            443,
        )
        .await;
        assert!(matches!(result, Err(SocksError::NoAcceptableMethods)));
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let (result, _) = run_handshake(
            vec![SOCKS_VERSION, METHOD_USERPASS],
            None,
            Address::V4(Ipv4Addr::new(1, 2, 3, 4)),
            443,
        )
        .await;
        assert!(matches!(result, Err(SocksError::AuthRequired)));
    }

    #[tokio::test]
    async fn test_bad_server_version() {
        let (result, _) = run_handshake(
            vec![0x04, METHOD_NO_AUTH],
            None,
            Address::V4(Ipv4Addr::new(1, 2, 3, 4)),
            443,
        )
        .await;
        assert!(matches!(result, Err(SocksError::BadVersion(0x04))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (mut client, mut server) = duplex(4096);
        let target = Address::Domain("blocked.example".to_string());

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
                .await
                .unwrap();

            let mut connect = vec![0u8; 4 + 1 + "blocked.example".len() + 2];
            server.read_exact(&mut connect).await.unwrap();
            // 0x05 = connection refused
            let refused = [SOCKS_VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
            server.write_all(&refused).await.unwrap();
        });

        let result = handshake(&mut client, None, &target, 443).await;
        assert!(matches!(result, Err(SocksError::ConnectFailed(0x05))));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (mut client, mut server) = duplex(4096);
        let auth = Auth::new("user".to_string(), "wrong".to_string());
        let target = Address::V4(Ipv4Addr::new(1, 2, 3, 4));

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[SOCKS_VERSION, METHOD_USERPASS])
                .await
                .unwrap();

            let mut header = [0u8; 2];
            server.read_exact(&mut header).await.unwrap();
            let mut user = vec![0u8; header[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            let pass_len = server.read_u8().await.unwrap();
            let mut pass = vec![0u8; pass_len as usize];
            server.read_exact(&mut pass).await.unwrap();
            server.write_all(&[AUTH_VERSION, 0x01]).await.unwrap();
        });

        let result = handshake(&mut client, Some(&auth), &target, 443).await;
        assert!(matches!(result, Err(SocksError::AuthRejected)));
        server_task.await.unwrap();
    }
}
