//! Outbound tunnels through HTTP CONNECT or SOCKS5 proxies.
//!
//! The target hostname is always handed to the proxy unresolved, so DNS
//! happens on the proxy side.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::errors::{WatchError, WatchResult};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;

/// Max bytes of HTTP response headers we accept from a proxy.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

pub async fn tunnel(proxy_url: &str, host: &str, port: u16) -> WatchResult<TcpStream> {
    let url = Url::parse(proxy_url)
        .map_err(|e| WatchError::Config(format!("invalid proxy URL: {e}")))?;
    let proxy_host = url
        .host_str()
        .ok_or_else(|| WatchError::Config("proxy URL has no host".into()))?;

    match url.scheme() {
        "http" => {
            let proxy_port = url.port().unwrap_or(8080);
            let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
            http_connect(&mut stream, &url, host, port).await?;
            Ok(stream)
        }
        "socks5" | "socks5h" => {
            let proxy_port = url.port().unwrap_or(1080);
            let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
            socks5_connect(&mut stream, &url, host, port).await?;
            Ok(stream)
        }
        other => Err(WatchError::Config(format!("unsupported proxy scheme {other}"))),
    }
}

fn credentials(url: &Url) -> Option<(String, String)> {
    if url.username().is_empty() {
        return None;
    }
    Some((
        url.username().to_string(),
        url.password().unwrap_or_default().to_string(),
    ))
}

async fn http_connect(stream: &mut TcpStream, url: &Url, host: &str, port: u16) -> WatchResult<()> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = credentials(url) {
        let token = STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(WatchError::Protocol("proxy response headers too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(WatchError::Network("proxy closed the connection during CONNECT".into()));
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    debug!(status_line, "HTTP CONNECT response");
    match status {
        "200" => Ok(()),
        "407" => Err(WatchError::Config("proxy authentication required".into())),
        _ => Err(WatchError::Network(format!("proxy CONNECT failed: {status_line}"))),
    }
}

async fn socks5_connect(stream: &mut TcpStream, url: &Url, host: &str, port: u16) -> WatchResult<()> {
    let creds = credentials(url);
    let method = if creds.is_some() { AUTH_USER_PASS } else { AUTH_NO_AUTH };
    stream.write_all(&[SOCKS_VERSION, 1, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(WatchError::Protocol(format!("unsupported SOCKS version: {}", reply[0])));
    }
    match reply[1] {
        AUTH_NO_AUTH => {}
        AUTH_USER_PASS => {
            let (user, pass) = creds.unwrap_or_default();
            if user.len() > 255 || pass.len() > 255 {
                return Err(WatchError::Config("SOCKS credentials too long".into()));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(WatchError::Config("SOCKS proxy rejected credentials".into()));
            }
        }
        AUTH_NO_ACCEPTABLE => {
            return Err(WatchError::Config("no acceptable SOCKS authentication method".into()));
        }
        other => {
            return Err(WatchError::Protocol(format!("unexpected SOCKS method {other}")));
        }
    }

    if host.len() > 255 {
        return Err(WatchError::Config(format!("hostname too long for SOCKS: {host}")));
    }
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != REPLY_SUCCESS {
        return Err(WatchError::Network(format!("SOCKS CONNECT failed with reply {}", head[1])));
    }
    // Drain the bound address so the stream starts at the IMAP greeting.
    let skip = match head[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(WatchError::Protocol(format!("bad SOCKS address type {other}"))),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}
