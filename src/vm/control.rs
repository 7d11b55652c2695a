//! VM control channel
//!
//! Host-initiated connections go through the supervisor's hybrid vsock
//! socket. The host writes `CONNECT <port>\n` and the supervisor answers
//! `OK <host_port>\n` once the guest accepts; from then on the stream is a
//! plain byte pipe to the guest listener.
//!
//! ```text
//! host                               guest agent (vsock :5000)
//!  │ CONNECT 5000\n                       │
//!  │ ◄──────────────── OK 1073741824\n    │
//!  │ {"v":1,"type":"exec",...}\n ───────► │
//!  │ ◄────────────── {"output":"..."}     │
//!  │ ◄────────────────────────── close    │
//! ```
//!
//! The request and response types are shared with the guest binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{IsolationError, Result};

/// Current control protocol version
pub const PROTOCOL_VERSION: u32 = 1;
/// Bound for the `CONNECT` / `OK` exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound for each read while waiting on the guest's response
pub const EXEC_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Requests understood by the guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Exec {
        command: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

/// Wire framing: `{"v":1,"type":...}`. A missing `v` reads as version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(flatten)]
    pub request: ControlRequest,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ControlEnvelope {
    pub fn new(request: ControlRequest) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            request,
        }
    }

    /// Newline-terminated JSON line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| IsolationError::Exec(format!("encode request: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

/// Guest reply: `{"output":...}` or `{"error":...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Output { output: String },
    Error { error: String },
}

/// Turn the raw bytes the guest sent into an exec result.
///
/// Compatibility shim: anything that is not a well-formed response is handed
/// back verbatim as output, because older guest images answer in plain text.
/// Only an empty reply is an error.
pub fn interpret_response(raw: &str) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(IsolationError::Exec(
            "guest closed the control channel without a response".to_string(),
        ));
    }
    match serde_json::from_str::<ControlResponse>(raw.trim()) {
        Ok(ControlResponse::Output { output }) => Ok(output),
        Ok(ControlResponse::Error { error }) => Err(IsolationError::Exec(error)),
        Err(_) => {
            tracing::debug!(bytes = raw.len(), "non-JSON control response, returning raw output");
            Ok(raw.to_string())
        }
    }
}

/// Open a stream to guest `port` through the hybrid vsock socket
pub async fn connect_port(
    vsock_socket: &Path,
    port: u32,
    timeout: Duration,
) -> Result<BufReader<UnixStream>> {
    let stream = UnixStream::connect(vsock_socket).await.map_err(|e| {
        IsolationError::Exec(format!(
            "failed to connect to {}: {}",
            vsock_socket.display(),
            e
        ))
    })?;
    let mut stream = BufReader::new(stream);

    stream
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .await
        .map_err(|e| IsolationError::Exec(format!("failed to send CONNECT: {}", e)))?;

    let mut response = String::new();
    match tokio::time::timeout(timeout, stream.read_line(&mut response)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            return Err(IsolationError::Exec(format!(
                "failed to read handshake response: {}",
                e
            )))
        }
        Err(_) => {
            return Err(IsolationError::Exec(format!(
                "no handshake response on port {} (guest may not be listening)",
                port
            )))
        }
    }

    let response = response.trim();
    if !response.starts_with("OK ") {
        return Err(IsolationError::Exec(format!(
            "unexpected handshake response '{}' (expected 'OK <port>')",
            response
        )));
    }
    Ok(stream)
}

/// Sends one request per connection to a VM's guest agent
#[derive(Debug, Clone)]
pub struct ControlClient {
    vsock_socket: PathBuf,
    port: u32,
    handshake_timeout: Duration,
    read_timeout: Duration,
}

impl ControlClient {
    pub fn new(vsock_socket: impl Into<PathBuf>, port: u32) -> Self {
        Self {
            vsock_socket: vsock_socket.into(),
            port,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            read_timeout: EXEC_INACTIVITY_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, handshake: Duration, read: Duration) -> Self {
        self.handshake_timeout = handshake;
        self.read_timeout = read;
        self
    }

    /// Run `command` in the guest shell with `env` added to its environment
    pub async fn exec(&self, command: &str, env: &BTreeMap<String, String>) -> Result<String> {
        let line = ControlEnvelope::new(ControlRequest::Exec {
            command: command.to_string(),
            env: env.clone(),
        })
        .to_line()?;

        let mut stream = connect_port(&self.vsock_socket, self.port, self.handshake_timeout).await?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| IsolationError::Exec(format!("failed to send request: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| IsolationError::Exec(format!("failed to send request: {}", e)))?;

        // Read until the guest closes
        let mut raw = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = tokio::time::timeout(self.read_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    IsolationError::Exec(format!(
                        "guest sent nothing for {:?}",
                        self.read_timeout
                    ))
                })?
                .map_err(|e| IsolationError::Exec(format!("control channel read: {}", e)))?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
        }

        interpret_response(&String::from_utf8_lossy(&raw))
    }
}
