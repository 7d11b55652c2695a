//! One proxied client connection
//!
//! ```text
//! client ──► read head (≤16 KiB, 10s) ──► CONNECT host:port ──► policy ──► 403
//!                                      │                        └──► dial ──► 200 ──► splice
//!                                      └► METHOD http://host/.. ──► policy ──► 403
//!                                                                 └──► dial ──► rewrite head ──► pipe
//! ```
//!
//! The domain check always runs before the upstream dial, so a denied host
//! never sees a connection attempt.

use std::time::Duration;

use futures_util::future::{self, Either};
use hyper::Uri;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;

use super::policy::DomainPolicy;
use crate::metrics::PROXY_REQUESTS;

/// Largest request head accepted (request line + headers)
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Time allowed for the client to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for dialing the upstream
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only apply to the client ↔ proxy hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

enum HeadError {
    TooLarge,
    Malformed,
    Closed,
}

/// Serve one client connection to completion
pub async fn handle_connection<S>(stream: S, policy: &DomainPolicy) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut client = BufReader::new(stream);

    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client)).await {
        Ok(Ok(head)) => head,
        Ok(Err(HeadError::Closed)) => return Ok(()),
        Ok(Err(HeadError::TooLarge)) => {
            return write_status(&mut client, 431, "Request Header Fields Too Large").await
        }
        Ok(Err(HeadError::Malformed)) => return write_status(&mut client, 400, "Bad Request").await,
        Err(_) => return write_status(&mut client, 408, "Request Timeout").await,
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        tunnel(client, head, policy).await
    } else {
        forward(client, head, policy).await
    }
}

async fn read_head<R>(reader: &mut R) -> Result<RequestHead, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut lines = Vec::new();
    loop {
        let remaining = MAX_HEAD_BYTES.saturating_sub(total);
        if remaining == 0 {
            return Err(HeadError::TooLarge);
        }
        let mut line = String::new();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_line(&mut line)
            .await
            .map_err(|_| HeadError::Malformed)?;
        if n == 0 {
            return Err(if lines.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed
            });
        }
        total += n;
        if !line.ends_with('\n') {
            return Err(HeadError::TooLarge);
        }
        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
        if line.is_empty() {
            if lines.is_empty() {
                // Tolerate stray CRLF before the request line
                continue;
            }
            break;
        }
        lines.push(line);
    }

    let mut parts = lines[0].split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::Malformed);
    };
    let headers = lines[1..]
        .iter()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Split `host:port` (or `[v6]:port`), defaulting the port
fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None if !authority.is_empty() => Some((authority.to_string(), default_port)),
        None => None,
    }
}

fn check(policy: &DomainPolicy, host: &str) -> bool {
    if policy.is_allowed(host) {
        PROXY_REQUESTS.with_label_values(&["allowed"]).inc();
        true
    } else {
        PROXY_REQUESTS.with_label_values(&["denied"]).inc();
        tracing::warn!(host, "egress blocked by domain policy");
        false
    }
}

async fn dial(host: &str, port: u16) -> Option<TcpStream> {
    match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "upstream connect failed");
            None
        }
        Err(_) => {
            tracing::debug!(host, port, "upstream connect timed out");
            None
        }
    }
}

async fn tunnel<S>(mut client: BufReader<S>, head: RequestHead, policy: &DomainPolicy) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some((host, port)) = parse_authority(&head.target, 443) else {
        return write_status(&mut client, 400, "Bad Request").await;
    };
    if !check(policy, &host) {
        return write_status(&mut client, 403, "Forbidden").await;
    }
    let Some(mut upstream) = dial(&host, port).await else {
        return write_status(&mut client, 502, "Bad Gateway").await;
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;

    // Bytes pipelined behind the head (e.g. a TLS ClientHello)
    let buffered = client.buffer().to_vec();
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
    }
    let mut client = client.into_inner();

    tracing::debug!(host = %host, port, "tunnel established");
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => tracing::debug!(host = %host, up, down, "tunnel closed"),
        Err(e) => tracing::debug!(host = %host, error = %e, "tunnel ended with error"),
    }
    Ok(())
}

async fn forward<S>(mut client: BufReader<S>, head: RequestHead, policy: &DomainPolicy) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Ok(uri) = head.target.parse::<Uri>() else {
        return write_status(&mut client, 400, "Bad Request").await;
    };
    if uri.scheme_str() != Some("http") {
        return write_status(&mut client, 400, "Bad Request").await;
    }
    let Some(host) = uri.host().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
    else {
        return write_status(&mut client, 400, "Bad Request").await;
    };
    let port = uri.port_u16().unwrap_or(80);

    if !check(policy, &host) {
        return write_status(&mut client, 403, "Forbidden").await;
    }
    let Some(upstream) = dial(&host, port).await else {
        return write_status(&mut client, 502, "Bad Gateway").await;
    };

    let origin_form = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut out = format!("{} {} {}\r\n", head.method, origin_form, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        has_host |= lower == "host";
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !has_host {
        match uri.port_u16() {
            Some(p) => out.push_str(&format!("Host: {}:{}\r\n", host, p)),
            None => out.push_str(&format!("Host: {}\r\n", host)),
        }
    }
    out.push_str("Connection: close\r\n\r\n");

    let (mut up_read, mut up_write) = upstream.into_split();
    up_write.write_all(out.as_bytes()).await?;

    // The client BufReader still holds any body bytes read with the head
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let upload = async {
        let _ = tokio::io::copy(&mut client_read, &mut up_write).await;
        let _ = up_write.shutdown().await;
    };
    let download = async {
        let relayed = tokio::io::copy(&mut up_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        relayed
    };

    // The response decides when the exchange is over; an idle client upload
    // must not keep the connection open
    let result = match future::select(Box::pin(upload), Box::pin(download)).await {
        Either::Left(((), download)) => download.await,
        Either::Right((relayed, _)) => relayed,
    };
    if let Err(e) = result {
        tracing::debug!(host = %host, error = %e, "response relay ended with error");
    }
    Ok(())
}

async fn write_status<W>(writer: &mut W, code: u16, reason: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        reason.len(),
        reason
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority() {
        assert_eq!(parse_authority("example.com:443", 443), Some(("example.com".into(), 443)));
        assert_eq!(parse_authority("example.com", 443), Some(("example.com".into(), 443)));
        assert_eq!(parse_authority("[::1]:8443", 443), Some(("::1".into(), 8443)));
        assert_eq!(parse_authority("host:notaport", 443), None);
        assert_eq!(parse_authority(":443", 443), None);
    }

    #[tokio::test]
    async fn test_head_parsing() {
        let raw: &[u8] = b"\r\nGET http://a.test/x HTTP/1.1\r\nHost: a.test\r\nX-Y: z\r\n\r\nbody";
        let mut reader = BufReader::new(raw);
        let Ok(head) = read_head(&mut reader).await else {
            panic!("head should parse");
        };
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://a.test/x");
        assert_eq!(head.headers.len(), 2);
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "body");
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let mut raw = b"GET http://a.test/ HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        raw.extend_from_slice(b"\r\n\r\n");
        let mut reader = BufReader::new(raw.as_slice());
        assert!(matches!(read_head(&mut reader).await, Err(HeadError::TooLarge)));
    }

    #[tokio::test]
    async fn test_denied_connect_gets_403() {
        let (client, server) = tokio::io::duplex(4096);
        let policy = DomainPolicy::new(&["example.com".to_string()], false);
        let serve = tokio::spawn(async move { handle_connection(server, &policy).await });

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(b"CONNECT evil.test:443 HTTP/1.1\r\nHost: evil.test:443\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        rd.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 403"));
        serve.await.unwrap().unwrap();
    }
}
