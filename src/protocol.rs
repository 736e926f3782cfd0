use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use subtle::{Choice, ConstantTimeEq};
use uuid::Uuid;

/// Protocol version understood by this gateway; echoed in the response header
pub const VERSION: u8 = 0;

pub const CMD_TCP: u8 = 1;
pub const CMD_UDP: u8 = 2;

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 2;
pub const ATYP_IPV6: u8 = 3;

/// Smallest possible request: version + uuid + addon length + command +
/// port + address type + a one-byte domain with its length prefix
pub const MIN_REQUEST_LEN: usize = 24;

/// The only UDP destination port the gateway relays
pub const DNS_PORT: u16 = 53;

/// Error type for request header parsing
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request header too short: {0} bytes")]
    TooShort(usize),

    #[error("request truncated inside the header")]
    Truncated,

    #[error("user id not in the accepted set")]
    AuthFailed,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("invalid address type {0:#04x}")]
    InvalidAddressType(u8),

    #[error("empty destination address")]
    EmptyAddress,

    #[error("destination domain is not valid UTF-8")]
    InvalidDomain,

    #[error("UDP is only relayed to port 53, got {0}")]
    UdpPortNotDns(u16),
}

/// Requested transport for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

/// Destination address in the three wire encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => ip.fmt(f),
            Address::Domain(name) => name.fmt(f),
            Address::V6(ip) => ip.fmt(f),
        }
    }
}

/// Decoded request header from the first client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub user: Uuid,
    pub command: Command,
    pub port: u16,
    pub address: Address,
    payload_offset: usize,
}

impl Request {
    /// Initial payload destined for the remote; may be empty
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload_offset..]
    }
}

/// Parse the request header from the first client message.
///
/// The whole header must be present in `buf`; a first chunk shorter than
/// the minimum header length is an error, no reassembly is attempted.
pub fn parse_request(buf: &[u8], users: &[Uuid]) -> Result<Request, ProtocolError> {
    if buf.len() < MIN_REQUEST_LEN {
        return Err(ProtocolError::TooShort(buf.len()));
    }

    let version = buf[0];

    let mut candidate = [0u8; 16];
    candidate.copy_from_slice(&buf[1..17]);
    if !user_accepted(&candidate, users) {
        return Err(ProtocolError::AuthFailed);
    }
    let user = Uuid::from_bytes(candidate);

    // Addons are opaque and skipped
    let addon_len = buf[17] as usize;
    let mut idx = 18 + addon_len;

    if buf.len() < idx + 4 {
        return Err(ProtocolError::Truncated);
    }
    let command = match buf[idx] {
        CMD_TCP => Command::Tcp,
        CMD_UDP => Command::Udp,
        other => return Err(ProtocolError::UnsupportedCommand(other)),
    };
    let port = u16::from_be_bytes([buf[idx + 1], buf[idx + 2]]);
    let atyp = buf[idx + 3];
    idx += 4;

    let address = match atyp {
        ATYP_IPV4 => {
            let octets = take(buf, idx, 4)?;
            idx += 4;
            Address::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        ATYP_DOMAIN => {
            let len = *buf.get(idx).ok_or(ProtocolError::Truncated)? as usize;
            idx += 1;
            if len == 0 {
                return Err(ProtocolError::EmptyAddress);
            }
            let raw = take(buf, idx, len)?;
            idx += len;
            let name =
                std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidDomain)?;
            Address::Domain(name.to_string())
        }
        ATYP_IPV6 => {
            let raw = take(buf, idx, 16)?;
            idx += 16;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Address::V6(Ipv6Addr::from(octets))
        }
        other => return Err(ProtocolError::InvalidAddressType(other)),
    };

    if command == Command::Udp && port != DNS_PORT {
        return Err(ProtocolError::UdpPortNotDns(port));
    }

    Ok(Request {
        version,
        user,
        command,
        port,
        address,
        payload_offset: idx,
    })
}

/// Two-byte response header: the request's version byte, then zero
pub fn response_header(version: u8) -> [u8; 2] {
    [version, 0x00]
}

/// Constant-time membership test against the accepted user set.
///
/// Every configured id is compared in full; no early exit on mismatch or
/// on the first match.
fn user_accepted(candidate: &[u8; 16], users: &[Uuid]) -> bool {
    let mut matched = Choice::from(0u8);
    for user in users {
        matched |= candidate[..].ct_eq(&user.as_bytes()[..]);
    }
    matched.into()
}

fn take(buf: &[u8], idx: usize, len: usize) -> Result<&[u8], ProtocolError> {
    buf.get(idx..idx + len).ok_or(ProtocolError::Truncated)
}
