//! TCP reachability probe for guacd.

use std::time::Duration;

use tokio::net::TcpStream;

/// Default per-attempt connect timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Checks whether something accepts TCP connections at `addr`.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    addr: String,
    timeout: Duration,
}

impl HealthProbe {
    /// `addr` is `host:port`, resolved on every attempt.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One connect attempt. The connection is dropped immediately.
    pub async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::trace!(addr = %self.addr, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::trace!(addr = %self.addr, "health probe timed out");
                false
            }
        }
    }
}
