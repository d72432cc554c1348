//! Proxy client handshakes
//!
//! Tunnels the session through an HTTP CONNECT, SOCKS4 or SOCKS5 proxy.
//! The caller establishes the TCP connection to the proxy itself;
//! [`proxy_connect`] then performs the handshake in-band and hands the
//! same stream back, now connected through to the target.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::QanatError;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5a;

/// Supported proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Socks4,
    Socks5,
    HttpConnect,
}

impl ProxyProtocol {
    /// Conventional proxy port when `-x` gives no explicit one.
    pub fn default_port(self) -> u16 {
        match self {
            ProxyProtocol::Socks4 | ProxyProtocol::Socks5 => 1080,
            ProxyProtocol::HttpConnect => 3128,
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = QanatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "4" => Ok(ProxyProtocol::Socks4),
            "5" => Ok(ProxyProtocol::Socks5),
            _ if s.eq_ignore_ascii_case("connect") => Ok(ProxyProtocol::HttpConnect),
            _ => Err(QanatError::InvalidConfig(format!(
                "unsupported proxy protocol: {s}"
            ))),
        }
    }
}

/// Perform the proxy handshake for `target_host:target_port` over an
/// already-connected stream to the proxy.
pub async fn proxy_connect<S>(
    mut stream: S,
    target_host: &str,
    target_port: u16,
    protocol: ProxyProtocol,
    username: Option<&str>,
) -> Result<S, QanatError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match protocol {
        ProxyProtocol::Socks5 => socks5_handshake(&mut stream, target_host, target_port).await?,
        ProxyProtocol::Socks4 => {
            socks4_handshake(&mut stream, target_host, target_port, username).await?
        }
        ProxyProtocol::HttpConnect => {
            http_connect_handshake(&mut stream, target_host, target_port, username).await?
        }
    }
    Ok(stream)
}

async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<(), QanatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE])
        .await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != SOCKS5_VERSION || method[1] != SOCKS5_AUTH_NONE {
        return Err(QanatError::ConnectionFailed(
            "SOCKS5 proxy rejected anonymous authentication".to_string(),
        ));
    }

    let mut request = BytesMut::with_capacity(262);
    request.put_slice(&[SOCKS5_VERSION, SOCKS_CMD_CONNECT, 0]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.put_u8(SOCKS5_ATYP_IPV4);
            request.put_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.put_u8(SOCKS5_ATYP_IPV6);
            request.put_slice(&v6.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > 255 {
                return Err(QanatError::ConnectionFailed(format!(
                    "{host}: hostname too long for SOCKS5"
                )));
            }
            request.put_u8(SOCKS5_ATYP_DOMAIN);
            request.put_u8(name.len() as u8);
            request.put_slice(name);
        }
    }
    request.put_u16(port);
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(QanatError::ConnectionFailed(
            "malformed SOCKS5 reply".to_string(),
        ));
    }
    if head[1] != 0 {
        return Err(QanatError::ConnectionFailed(format!(
            "SOCKS5 proxy: {}",
            socks5_reply_message(head[1])
        )));
    }

    // Drain the bound-address trailer so the stream starts clean.
    let addr_len = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(QanatError::ConnectionFailed(format!(
                "SOCKS5 reply with unknown address type {other}"
            )));
        }
    };
    let mut trailer = vec![0u8; addr_len + 2];
    stream.read_exact(&mut trailer).await?;

    debug!("SOCKS5 tunnel to {host}:{port} established");
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

async fn socks4_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
) -> Result<(), QanatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS4 speaks IPv4 only; resolve the target ourselves.
    let target: Ipv4Addr = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4,
        Ok(IpAddr::V6(_)) => {
            return Err(QanatError::ConnectionFailed(format!(
                "{host}: SOCKS4 cannot carry IPv6 targets"
            )));
        }
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| QanatError::ResolutionFailed(format!("{host}: {e}")))?
            .find_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                QanatError::ResolutionFailed(format!("{host}: no IPv4 address for SOCKS4"))
            })?,
    };

    let mut request = BytesMut::with_capacity(16);
    request.put_slice(&[SOCKS4_VERSION, SOCKS_CMD_CONNECT]);
    request.put_u16(port);
    request.put_slice(&target.octets());
    if let Some(user) = username {
        request.put_slice(user.as_bytes());
    }
    request.put_u8(0);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(QanatError::ConnectionFailed(format!(
            "SOCKS4 proxy refused the connection (code {:#04x})",
            reply[1]
        )));
    }

    debug!("SOCKS4 tunnel to {target}:{port} established");
    Ok(())
}

async fn http_connect_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: Option<&str>,
) -> Result<(), QanatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host}:{port} HTTP/1.0\r\n");
    if let Some(user) = username {
        let credentials = BASE64.encode(format!("{user}:"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response byte-wise up to the blank line so nothing of the
    // tunneled stream is consumed.
    let mut response = BytesMut::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(QanatError::ConnectionFailed(
                "oversized HTTP proxy response".to_string(),
            ));
        }
        stream.read_exact(&mut byte).await?;
        response.put_u8(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(QanatError::ConnectionFailed(format!(
            "HTTP proxy: {status_line}"
        )));
    }

    debug!("HTTP CONNECT tunnel to {host}:{port} established");
    Ok(())
}
