//! HTTP CONNECT tunnelling through a proxy hop

use std::io;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::Destination;
use crate::model::Auth;

/// Upper bound on the proxy's response header block
pub const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Ask the HTTP proxy at the other end of `stream` to open a tunnel to `dest`
///
/// Succeeds on any 2xx status. The response is read byte by byte up to the
/// blank line so no tunnelled data is consumed.
pub async fn connect<S>(stream: &mut S, dest: &Destination, auth: Option<&Auth>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = match dest {
        Destination::Ip(addr) => addr.to_string(),
        Destination::Domain(host, port) => format!("{host}:{port}"),
    };

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = auth {
        let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let header = read_header(stream).await?;
    let status_line = header.lines().next().unwrap_or_default();
    trace!("HTTP CONNECT response: {}", status_line);

    let status = parse_status(status_line)?;
    match status {
        200..=299 => Ok(()),
        407 => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("proxy authentication required: {status_line}"),
        )),
        _ => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("proxy refused CONNECT: {status_line}"),
        )),
    }
}

async fn read_header<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_RESPONSE_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response header too large",
            ));
        }
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_status(line: &str) -> io::Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid proxy response: {line}"),
        ));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid proxy status line: {line}"),
            )
        })
}
