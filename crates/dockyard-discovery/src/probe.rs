//! Connectivity probing.
//!
//! A probe opens a raw connection and closes it straight away. Failure is
//! evidence that the endpoint is not ready yet, never an error: it is
//! logged and reported as `false`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use dockyard_core::HostAddress;

/// Checks whether an endpoint accepts connections.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, target: &HostAddress) -> bool;
}

/// Probe by TCP connect (or unix socket connect) bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self, target: &HostAddress) -> bool {
        debug!(%target, "trying to connect");

        let attempt = async {
            if target.is_unix() {
                connect_unix(&target.host).await
            } else {
                tokio::net::TcpStream::connect(target.authority())
                    .await
                    .map(drop)
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => {
                debug!(%target, "able to connect");
                true
            }
            Ok(Err(e)) => {
                warn!(%target, error = %e, "failed to connect");
                false
            }
            Err(_) => {
                warn!(%target, timeout_ms = self.timeout.as_millis() as u64, "connect timed out");
                false
            }
        }
    }
}

#[cfg(unix)]
async fn connect_unix(path: &str) -> std::io::Result<()> {
    tokio::net::UnixStream::connect(path).await.map(drop)
}

#[cfg(not(unix))]
async fn connect_unix(path: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("unix sockets unsupported on this platform: {path}"),
    ))
}
