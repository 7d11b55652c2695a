//! Integration tests for the egress proxy over real loopback sockets

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use agentvisor::proxy::{DomainPolicy, EgressProxy, ProxyEndpoint, ProxyHandle};

async fn start_proxy(allowed: &[&str]) -> (ProxyHandle, SocketAddr) {
    let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    let proxy = EgressProxy::bind(
        "test",
        ProxyEndpoint::Tcp("127.0.0.1:0".parse().unwrap()),
        DomainPolicy::new(&allowed, false),
    )
    .await
    .unwrap();
    let ProxyEndpoint::Tcp(addr) = proxy.endpoint().clone() else {
        panic!("expected a TCP endpoint");
    };
    (proxy.spawn(), addr)
}

/// Read a response head up to the blank line
async fn read_response_head(reader: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        head.push_str(&line);
        if n == 0 || line == "\r\n" {
            return head;
        }
    }
}

#[tokio::test]
async fn test_denied_connect_never_reaches_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let (proxy, addr) = start_proxy(&["example.com"]).await;

    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes())
        .await
        .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"), "got {:?}", head);

    let accepted = tokio::time::timeout(Duration::from_millis(200), upstream.accept()).await;
    assert!(accepted.is_err(), "denied host saw a connection");

    proxy.stop().await;
}

#[tokio::test]
async fn test_allowed_connect_tunnels_bytes() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
    });

    let (proxy, addr) = start_proxy(&["127.0.0.1"]).await;
    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
    client
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
                port = upstream_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got {:?}", head);

    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_is_rewritten_to_origin_form() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let seen = tokio::spawn(async move {
        let (conn, _) = upstream.accept().await.unwrap();
        let mut conn = BufReader::new(conn);
        let mut request = String::new();
        loop {
            let mut line = String::new();
            conn.read_line(&mut line).await.unwrap();
            request.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        conn.shutdown().await.unwrap();
        request
    });

    let (proxy, addr) = start_proxy(&["127.0.0.1"]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/status?x=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
                upstream_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("ok"));

    let request = seen.await.unwrap();
    assert!(request.starts_with("GET /status?x=1 HTTP/1.1\r\n"), "got {:?}", request);
    assert!(request.contains(&format!("Host: 127.0.0.1:{}\r\n", upstream_port)));
    assert!(request.contains("Connection: close\r\n"));
    assert!(!request.to_ascii_lowercase().contains("proxy-connection"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_to_denied_host_is_forbidden() {
    let (proxy, addr) = start_proxy(&[]).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://blocked.test/ HTTP/1.1\r\nHost: blocked.test\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403"), "got {:?}", response);

    proxy.stop().await;
}
