//! Per-VM egress proxy
//!
//! Each VM gets its own forwarding HTTP proxy bound to a private socket. For
//! VMs that is the hybrid vsock listener `<runtime>/vsock.sock_<port>`, so
//! only that guest can reach it; no host port is opened and no packet
//! filtering is needed.
//!
//! ```text
//! guest curl ──HTTPS_PROXY──► 127.0.0.1:3128 (guest forwarder)
//!                                  │ vsock CID 2 :3128
//!                                  ▼
//!              host <runtime>/vsock.sock_3128 ──► EgressProxy ──► internet
//! ```
//!
//! [`ProxySupervisor`] keeps one running proxy per key and always stops the
//! previous instance before starting a new one.

pub mod connection;
pub mod policy;

pub use policy::DomainPolicy;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

/// Concurrent connections served by one proxy
const MAX_CONNECTIONS: usize = 64;

/// Where a proxy listens
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEndpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound, not yet running proxy
pub struct EgressProxy {
    name: String,
    listener: Listener,
    endpoint: ProxyEndpoint,
    policy: Arc<DomainPolicy>,
}

impl EgressProxy {
    /// Bind `endpoint`; a stale Unix socket file is replaced
    pub async fn bind(
        name: impl Into<String>,
        endpoint: ProxyEndpoint,
        policy: DomainPolicy,
    ) -> std::io::Result<Self> {
        let (listener, endpoint) = match endpoint {
            ProxyEndpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                (Listener::Unix(listener), ProxyEndpoint::Unix(path))
            }
            ProxyEndpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), ProxyEndpoint::Tcp(local))
            }
        };
        Ok(Self {
            name: name.into(),
            listener,
            endpoint,
            policy: Arc::new(policy),
        })
    }

    /// Resolved endpoint (the real port when bound to port 0)
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// Start the accept loop on the runtime
    pub fn spawn(self) -> ProxyHandle {
        let endpoint = self.endpoint.clone();
        let span = tracing::info_span!("proxy", vm = %self.name);
        let task = tokio::spawn(accept_loop(self.listener, self.policy).instrument(span));
        tracing::debug!(proxy = %self.name, endpoint = ?endpoint, "egress proxy started");
        ProxyHandle {
            name: self.name,
            endpoint,
            task,
        }
    }
}

async fn accept_loop(listener: Listener, policy: Arc<DomainPolicy>) {
    let permits = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    // Owning the connection tasks means aborting this loop aborts them too
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            accepted = accept(&listener) => accepted,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "proxy accept failed");
                continue;
            }
        };
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            tracing::warn!(limit = MAX_CONNECTIONS, "proxy connection limit reached, dropping");
            continue;
        };
        let policy = policy.clone();
        connections.spawn(
            async move {
                let result = match stream {
                    Accepted::Unix(s) => connection::handle_connection(s, &policy).await,
                    Accepted::Tcp(s) => connection::handle_connection(s, &policy).await,
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "proxy connection ended");
                }
                drop(permit);
            }
            .instrument(tracing::debug_span!("proxy.connection")),
        );
    }
}

enum Accepted {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn accept(listener: &Listener) -> std::io::Result<Accepted> {
    match listener {
        Listener::Unix(l) => l.accept().await.map(|(s, _)| Accepted::Unix(s)),
        Listener::Tcp(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
    }
}

/// A running proxy; stopping (or dropping) it ends every connection
pub struct ProxyHandle {
    name: String,
    endpoint: ProxyEndpoint,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// Abort the accept loop and remove the socket file
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        if let ProxyEndpoint::Unix(path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(proxy = %self.name, error = %e, "failed to remove proxy socket");
                }
            }
        }
        tracing::debug!(proxy = %self.name, "egress proxy stopped");
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One proxy per key (VM handle), restarted fresh on every start
#[derive(Default)]
pub struct ProxySupervisor {
    running: Mutex<HashMap<String, ProxyHandle>>,
}

impl ProxySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop any proxy registered under `key`, then bind and start a new one
    pub async fn start(
        &self,
        key: &str,
        endpoint: ProxyEndpoint,
        policy: DomainPolicy,
    ) -> std::io::Result<ProxyEndpoint> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.remove(key) {
            tracing::debug!(proxy = key, "replacing running egress proxy");
            previous.stop().await;
        }
        let proxy = EgressProxy::bind(key, endpoint, policy).await?;
        let handle = proxy.spawn();
        let endpoint = handle.endpoint().clone();
        running.insert(key.to_string(), handle);
        Ok(endpoint)
    }

    /// Stop the proxy under `key`; unknown keys are a no-op
    pub async fn stop(&self, key: &str) {
        let handle = self.running.lock().await.remove(key);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

}
