//! SOCKS5 protocol helpers (RFC 1928, RFC 1929)
//!
//! Client side: CONNECT through a SOCKS5 hop, with optional
//! username/password. Server side: the handshake for chain-type rules that
//! expose a SOCKS5 listener.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::Destination;
use crate::model::Auth;

/// SOCKS5 protocol version (RFC 1928)
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required (0x00)
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication - RFC 1929 (0x02)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// No acceptable methods (0xFF)
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password auth sub-negotiation version (RFC 1929)
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command (0x01)
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Convert reply code to human-readable message
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn encode_destination(dest: &Destination, out: &mut Vec<u8>) -> io::Result<()> {
    match dest {
        Destination::Ip(SocketAddr::V4(v4)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        Destination::Ip(SocketAddr::V6(v6)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
        Destination::Domain(host, port) => {
            let len = u8::try_from(host.len())
                .map_err(|_| protocol_error("domain name too long (max 255)"))?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

// ============================================================================
// Client side
// ============================================================================

/// Ask the SOCKS5 proxy at the other end of `stream` to CONNECT to `dest`
pub async fn connect<S>(stream: &mut S, dest: &Destination, auth: Option<&Auth>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };
    stream.write_all(methods).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!("SOCKS5 method response: {:?}", response);

    if response[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "invalid SOCKS version: {:#04x}",
            response[0]
        )));
    }

    match response[1] {
        AUTH_METHOD_NONE => {}
        AUTH_METHOD_PASSWORD => {
            let auth = auth.ok_or_else(|| {
                io::Error::new(io::ErrorKind::PermissionDenied, "proxy requires authentication")
            })?;
            authenticate(stream, auth).await?;
        }
        AUTH_METHOD_NO_ACCEPTABLE => {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "no acceptable authentication method",
            ));
        }
        other => {
            return Err(protocol_error(format!(
                "unsupported auth method: {other:#04x}"
            )));
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    encode_destination(dest, &mut request)?;
    stream.write_all(&request).await?;

    read_connect_reply(stream).await
}

async fn authenticate<S>(stream: &mut S, auth: &Auth) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(auth.username.len())
        .map_err(|_| protocol_error("username too long (max 255)"))?;
    let plen = u8::try_from(auth.password.len())
        .map_err(|_| protocol_error("password too long (max 255)"))?;

    let mut req = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
    req.push(AUTH_PASSWORD_VERSION);
    req.push(ulen);
    req.extend_from_slice(auth.username.as_bytes());
    req.push(plen);
    req.extend_from_slice(auth.password.as_bytes());
    stream.write_all(&req).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(protocol_error(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "SOCKS5 authentication failed",
        ));
    }
    Ok(())
}

async fn read_connect_reply<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "invalid SOCKS version in reply: {:#04x}",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        let kind = if header[1] == REPLY_CONNECTION_REFUSED {
            io::ErrorKind::ConnectionRefused
        } else {
            io::ErrorKind::Other
        };
        return Err(io::Error::new(kind, reply_message(header[1])));
    }

    // Bound address is read and discarded
    let skip = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(protocol_error(format!(
                "unsupported address type in reply: {other:#04x}"
            )))
        }
    };
    let mut rest = vec![0u8; skip];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

// ============================================================================
// Server side
// ============================================================================

/// Run the server half of the handshake and return the requested target
///
/// With `auth` set, only username/password is accepted and the credentials
/// must match. On failure the appropriate reply has already been sent.
pub async fn accept<S>(stream: &mut S, auth: Option<&Auth>) -> io::Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!("invalid SOCKS version: {}", buf[0])));
    }
    let nmethods = usize::from(buf[1]);
    if nmethods == 0 {
        return Err(protocol_error("invalid nmethods: 0"));
    }
    stream.read_exact(&mut buf[..nmethods]).await?;
    let offered = &buf[..nmethods];

    let wanted = if auth.is_some() {
        AUTH_METHOD_PASSWORD
    } else {
        AUTH_METHOD_NONE
    };
    if !offered.contains(&wanted) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "no acceptable auth method",
        ));
    }
    stream.write_all(&[SOCKS5_VERSION, wanted]).await?;

    if let Some(expected) = auth {
        verify_credentials(stream, expected).await?;
    }

    // VER | CMD | RSV | ATYP
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "invalid SOCKS version in request: {}",
            buf[0]
        )));
    }
    if buf[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(protocol_error(format!("unsupported command: {}", buf[1])));
    }

    let dest = match buf[3] {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Destination::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Destination::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = usize::from(buf[0]);
            if len == 0 {
                send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
                return Err(protocol_error("empty domain name"));
            }
            stream.read_exact(&mut buf[..len + 2]).await?;
            let host = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            Destination::Domain(host, port)
        }
        other => {
            send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(protocol_error(format!("unsupported address type: {other}")));
        }
    };

    Ok(dest)
}

async fn verify_credentials<S>(stream: &mut S, expected: &Auth) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != AUTH_PASSWORD_VERSION {
        return Err(protocol_error(format!("invalid auth version: {}", buf[0])));
    }
    let ulen = usize::from(buf[1]);
    stream.read_exact(&mut buf[..ulen]).await?;
    let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

    stream.read_exact(&mut buf[..1]).await?;
    let plen = usize::from(buf[0]);
    stream.read_exact(&mut buf[..plen]).await?;
    let password = String::from_utf8_lossy(&buf[..plen]).to_string();

    if username == expected.username && password == expected.password {
        stream.write_all(&[AUTH_PASSWORD_VERSION, 0x00]).await?;
        Ok(())
    } else {
        stream.write_all(&[AUTH_PASSWORD_VERSION, 0x01]).await?;
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "SOCKS5 authentication failed",
        ))
    }
}

/// Send a reply with an unspecified bound address
pub async fn send_reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await
}

/// Map a dial failure onto a reply code
#[must_use]
pub fn reply_for_error(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
        io::ErrorKind::PermissionDenied => REPLY_NOT_ALLOWED,
        _ => REPLY_HOST_UNREACHABLE,
    }
}
