//! # Opening Handshake
//!
//! Client side of the HTTP/1.1 upgrade. Only plain `ws://` URLs are accepted;
//! anything else is refused before a socket is opened.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::Url;

use crate::error::TransportError;

/// Response headers larger than this are treated as a failed handshake.
const MAX_RESPONSE_BYTES: usize = 8 * 1024;

const MAX_STATUS_LINE_BYTES: usize = 256;

/// Parsed `ws://` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsTarget {
    pub host: String,
    pub port: u16,
    /// Path plus query, as sent on the request line
    pub resource: String,
}

impl WsTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_ws_url(raw: &str) -> Result<WsTarget, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;

    if url.scheme() != "ws" {
        return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{raw}: missing host")))?
        .to_string();
    let port = url.port().unwrap_or(80);

    let mut resource = url.path().to_string();
    if resource.is_empty() {
        resource.push('/');
    }
    if let Some(query) = url.query() {
        resource.push('?');
        resource.push_str(query);
    }

    Ok(WsTarget {
        host,
        port,
        resource,
    })
}

/// Random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

pub fn build_upgrade_request(target: &WsTarget, key: &str) -> String {
    let host = if target.port == 80 {
        target.host.clone()
    } else {
        target.authority()
    };

    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        target.resource, host, key
    )
}

/// Read the status line and headers, requiring `HTTP/1.1 101` and
/// `Upgrade: websocket`. Every failure, including I/O errors and bytes that
/// are not UTF-8, is reported as [`TransportError::HandshakeFailed`].
///
/// Stops exactly at the blank line so any frame bytes that follow stay in the
/// reader's buffer.
pub async fn read_upgrade_response<R>(reader: &mut R) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_response_line(reader, MAX_STATUS_LINE_BYTES).await?;
    let mut budget = MAX_RESPONSE_BYTES - status_line.len();

    let mut parts = status_line.split_whitespace();
    if parts.next() != Some("HTTP/1.1") || parts.next() != Some("101") {
        return Err(TransportError::HandshakeFailed(format!(
            "unexpected status line '{}'",
            status_line.trim_end()
        )));
    }

    let mut upgrade_ok = false;
    loop {
        let line = read_response_line(reader, budget).await?;
        budget -= line.len();

        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
            {
                upgrade_ok = true;
            }
        }
    }

    if !upgrade_ok {
        return Err(TransportError::HandshakeFailed(
            "missing 'Upgrade: websocket' response header".into(),
        ));
    }
    Ok(())
}

/// One CRLF-terminated response line of at most `limit` bytes.
async fn read_response_line<R>(reader: &mut R, limit: usize) -> Result<String, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut raw)
        .await
        .map_err(|e| TransportError::HandshakeFailed(format!("read failed: {e}")))?;

    if !raw.ends_with(b"\n") {
        return Err(TransportError::HandshakeFailed(if n >= limit {
            "response headers too large".into()
        } else {
            "connection closed during handshake".into()
        }));
    }

    String::from_utf8(raw).map_err(|_| TransportError::HandshakeFailed("response is not valid utf-8".into()))
}
