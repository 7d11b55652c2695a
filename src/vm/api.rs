//! cloud-hypervisor control API client
//!
//! The supervisor exposes its REST API on a Unix socket. The only call made
//! is the graceful power-off request; liveness comes from the supervisor PID.

use std::path::PathBuf;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;

use crate::error::{IsolationError, Result};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

const SHUTDOWN_ENDPOINT: &str = "/api/v1/vm.shutdown";

/// Client for one supervisor's API socket
pub struct SupervisorClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl SupervisorClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send a request with an empty body; any 2xx is success
    async fn send(&self, method: Method, endpoint: &str, timeout: Duration) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Length", "0")
            .body(Full::new(Bytes::new()))
            .map_err(|e| IsolationError::Exec(format!("{}: {}", endpoint, e)))?;

        let res = tokio::time::timeout(timeout, self.client.request(req))
            .await
            .map_err(|_| IsolationError::Exec(format!("{} timed out after {:?}", endpoint, timeout)))?
            .map_err(|e| IsolationError::Exec(format!("{}: {}", endpoint, e)))?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();
        Err(IsolationError::Exec(format!(
            "{} returned {}: {}",
            endpoint,
            status,
            body.trim()
        )))
    }

    /// Ask the guest to power off
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.send(Method::PUT, SHUTDOWN_ENDPOINT, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// One-shot fake API server returning `status_line`; yields the request head
    fn serve_once(path: &Path, status_line: &'static str) -> tokio::task::JoinHandle<String> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let response = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        })
    }

    #[tokio::test]
    async fn test_shutdown_sends_put() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let server = serve_once(&sock, "HTTP/1.1 204 No Content");

        let client = SupervisorClient::new(&sock);
        client.shutdown(Duration::from_secs(2)).await.unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("PUT /api/v1/vm.shutdown HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_shutdown_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let _server = serve_once(&sock, "HTTP/1.1 500 Internal Server Error");

        let client = SupervisorClient::new(&sock);
        assert!(client.shutdown(Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = SupervisorClient::new(dir.path().join("nope.sock"));
        assert!(client.shutdown(Duration::from_secs(1)).await.is_err());
    }
}
