//! Error types for rpdb.

use std::net::SocketAddr;

use thiserror::Error;

/// Core error type for remote debugging sessions.
///
/// None of these escape `DebugSessionController`; they are reported on the
/// log and turned into a [`crate::SessionOutcome`].
#[derive(Error, Debug)]
pub enum DebugError {
    /// The port is bound by another process or another session owner.
    #[error("Address in use: port {port} is already bound")]
    AddressInUse { port: u16 },

    /// The same owner re-entered debugging on a port it already holds.
    #[error("Recurrent invocation on port {port}")]
    RecurrentInvocation { port: u16 },

    /// Active mode: nothing is listening at the target.
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The REPL engine returned an error or panicked while attached.
    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// Socket shutdown failed during teardown.
    #[error("Teardown error: {0}")]
    Teardown(std::io::Error),

    /// Every port in the scanned window is occupied.
    #[error("No available ports found after {attempts} attempts starting from {start}")]
    ExhaustedRange { start: u16, attempts: u16 },

    /// Establishment was cancelled before a peer arrived.
    #[error("Session establishment cancelled")]
    Cancelled,

    /// The console stream reached end-of-input or was already closed.
    #[error("Console closed")]
    ConsoleClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address parsing errors
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError {
    /// Whether the retry policy applies to this error.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::AddressInUse { .. })
    }
}

impl From<config::ConfigError> for DebugError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for rpdb operations.
pub type Result<T> = std::result::Result<T, DebugError>;
