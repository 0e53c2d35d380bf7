//! Request head capture.
//!
//! Reads the HTTP request line and headers only, to learn which port the
//! client asked for. Every byte read is kept so it can be replayed upstream
//! verbatim; nothing is rewritten.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_HTTP_PORT: u16 = 80;
const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("client sent no complete request head within {0:?}")]
    TimedOut(Duration),

    #[error("client closed the connection before the request head ended")]
    Closed,

    #[error("request head exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request head: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderLimits {
    /// Total time for the whole head, not per read.
    pub deadline: Duration,
    pub max_bytes: usize,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
            max_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Everything read from the client so far, including any body bytes
    /// that arrived with the head.
    pub buffered: Vec<u8>,
    /// Length of the head within `buffered`, terminator included.
    pub head_len: usize,
    pub host: Option<String>,
    pub port: u16,
}

/// Read the request head under `limits`.
pub async fn read_request_head<R>(
    stream: &mut R,
    limits: &HeaderLimits,
) -> Result<RequestHead, HeaderError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(limits.deadline, read_head(stream, limits.max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(HeaderError::TimedOut(limits.deadline)),
    }
}

async fn read_head<R>(stream: &mut R, max_bytes: usize) -> Result<RequestHead, HeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HeaderError::Closed);
        }

        let search_from = buffered.len().saturating_sub(3);
        buffered.extend_from_slice(&chunk[..n]);

        if let Some(head_len) = find_head_end(&buffered, search_from) {
            if head_len > max_bytes {
                return Err(HeaderError::TooLarge { limit: max_bytes });
            }
            let host = host_header(&buffered[..head_len]);
            let port = host.as_deref().map(port_from_host).unwrap_or(DEFAULT_HTTP_PORT);
            return Ok(RequestHead {
                buffered,
                head_len,
                host,
                port,
            });
        }

        if buffered.len() > max_bytes {
            return Err(HeaderError::TooLarge { limit: max_bytes });
        }
    }
}

/// Offset just past the blank line ending the head (`\r\n\r\n` or `\n\n`).
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if i >= 1 && buf[i - 1] == b'\n' {
                return Some(i + 1);
            }
            if i >= 2 && buf[i - 1] == b'\r' && buf[i - 2] == b'\n' {
                return Some(i + 1);
            }
        }
        i += 1;
    }
    None
}

/// Value of the last `Host:` header line, matched case-insensitively.
fn host_header(head: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .last()
}

/// Port named by a `Host:` value.
///
/// No port means 80, as does a non-numeric one. A numeric port outside
/// 1..=65535 maps to 0, which no rule set allows.
pub fn port_from_host(host: &str) -> u16 {
    let port_part = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        match rest.split_once(']') {
            Some((_, after)) => after.strip_prefix(':'),
            None => None,
        }
    } else {
        match host.rsplit_once(':') {
            // Bare IPv6 without brackets carries no port.
            Some((addr, _)) if addr.contains(':') => None,
            Some((_, port)) => Some(port),
            None => None,
        }
    };

    match port_part.map(|p| p.trim().parse::<u32>()) {
        Some(Ok(port)) => u16::try_from(port).unwrap_or(0),
        _ => DEFAULT_HTTP_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn host_port_forms() {
        assert_eq!(port_from_host("example.com"), 80);
        assert_eq!(port_from_host("example.com:8080"), 8080);
        assert_eq!(port_from_host("[::1]:8443"), 8443);
        assert_eq!(port_from_host("[::1]"), 80);
        assert_eq!(port_from_host("2001:db8::1"), 80);
        assert_eq!(port_from_host("example.com:http"), 80);
        assert_eq!(port_from_host("example.com:70000"), 0);
    }

    #[test]
    fn head_end_variants() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody", 0), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\n\nbody", 0), Some(16));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: a\r\n", 0), None);
    }

    #[tokio::test]
    async fn captures_head_and_early_body() {
        let request = b"POST /x HTTP/1.1\r\nhOsT: api.local:8080\r\nContent-Length: 4\r\n\r\nping";
        let mut reader = &request[..];

        let head = read_request_head(&mut reader, &HeaderLimits::default())
            .await
            .unwrap();
        assert_eq!(head.port, 8080);
        assert_eq!(head.host.as_deref(), Some("api.local:8080"));
        assert_eq!(head.buffered, request.to_vec());
        assert_eq!(head.head_len, request.len() - 4);
    }

    #[tokio::test]
    async fn missing_host_defaults_to_80() {
        let mut reader = &b"GET / HTTP/1.0\r\n\r\n"[..];
        let head = read_request_head(&mut reader, &HeaderLimits::default())
            .await
            .unwrap();
        assert_eq!(head.port, 80);
        assert!(head.host.is_none());
    }

    #[tokio::test]
    async fn head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\nHost: a:443\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"\n\r\n").await.unwrap();
            client
        });

        let head = read_request_head(&mut server, &HeaderLimits::default())
            .await
            .unwrap();
        assert_eq!(head.port, 443);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn eof_before_blank_line() {
        let mut reader = &b"GET / HTTP/1.1\r\nHost: a\r\n"[..];
        let err = read_request_head(&mut reader, &HeaderLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HeaderError::Closed));
    }

    #[tokio::test]
    async fn oversized_head() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(200));
        let mut reader = &request[..];
        let limits = HeaderLimits {
            max_bytes: 64,
            ..HeaderLimits::default()
        };

        let err = read_request_head(&mut reader, &limits).await.unwrap_err();
        assert!(matches!(err, HeaderError::TooLarge { limit: 64 }));
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let limits = HeaderLimits {
            deadline: Duration::from_millis(50),
            ..HeaderLimits::default()
        };

        let err = read_request_head(&mut server, &limits).await.unwrap_err();
        assert!(matches!(err, HeaderError::TimedOut(_)));
    }
}
