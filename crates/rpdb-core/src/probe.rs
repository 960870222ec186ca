//! Port probing without binding.
//!
//! A connect attempt is less intrusive than a trial bind: it leaves the port
//! untouched for whoever is about to bind it.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{DebugError, Result};

/// Connect timeout used when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Answers "is something already accepting connections on this port?".
#[derive(Debug, Clone, Copy)]
pub struct PortProbe {
    timeout: Duration,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns true when a connection to `host:port` succeeds.
    ///
    /// Refusal, timeout and resolution failures all count as "available".
    pub async fn is_in_use(&self, host: &str, port: u16) -> bool {
        match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "Probe connect failed, port available");
                false
            }
            Err(_) => {
                debug!(host, port, "Probe timed out, port available");
                false
            }
        }
    }

    /// Return the first port in `[start_port, start_port + max_attempts)` that
    /// is not in use.
    pub async fn find_available_port(
        &self,
        host: &str,
        start_port: u16,
        max_attempts: u16,
    ) -> Result<u16> {
        let end = u32::from(start_port) + u32::from(max_attempts);
        for port in u32::from(start_port)..end.min(u32::from(u16::MAX) + 1) {
            let port = port as u16;
            if !self.is_in_use(host, port).await {
                return Ok(port);
            }
        }
        Err(DebugError::ExhaustedRange { start: start_port, attempts: max_attempts })
    }
}

/// Probe with the default timeout.
pub async fn is_in_use(host: &str, port: u16) -> bool {
    PortProbe::default().is_in_use(host, port).await
}

/// Scan with the default timeout.
pub async fn find_available_port(host: &str, start_port: u16, max_attempts: u16) -> Result<u16> {
    PortProbe::default().find_available_port(host, start_port, max_attempts).await
}
