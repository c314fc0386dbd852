//! Minimal SOCKS5 client (RFC 1928)
//!
//! Only what a probe needs: no authentication, CONNECT, and a domain
//! name target so the proxy resolves it. Resolving locally would leak
//! the provider lookup to the local resolver.

use crate::error::{Error, Result};
use crate::proxy::ProxyEndpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a TCP stream to `host:port` tunnelled through the proxy.
///
/// # Errors
///
/// Returns an error if the proxy is unreachable or refuses the CONNECT.
pub async fn connect(proxy: &ProxyEndpoint, host: &str, port: u16) -> Result<TcpStream> {
    debug!("Connecting to {}:{} via SOCKS {}", host, port, proxy);
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    handshake(&mut stream, host, port).await?;
    Ok(stream)
}

/// Run the SOCKS5 greeting and CONNECT exchange on an open stream.
///
/// # Errors
///
/// Returns a SOCKS error if `host` is longer than 255 bytes, the proxy
/// demands authentication or answers CONNECT with a failure code, and an
/// I/O error if the stream breaks.
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_len = u8::try_from(host.len())
        .map_err(|_| Error::Socks(format!("host name too long: {} bytes", host.len())))?;
    if host_len == 0 {
        return Err(Error::Socks("empty host name".into()));
    }

    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(Error::Socks(format!("unexpected SOCKS version {}", choice[0])));
    }
    if choice[1] != NO_AUTH {
        return Err(Error::Socks("proxy requires authentication".into()));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(Error::Socks(format!("unexpected SOCKS version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(Error::Socks(reply_message(reply[1]).to_string()));
    }

    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => return Err(Error::Socks(format!("unknown address type {other}"))),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

const fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS failure",
    }
}
