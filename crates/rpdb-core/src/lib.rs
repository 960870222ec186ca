//! rpdb: remote line-oriented debugging over TCP.
//!
//! A debuggee calls into a [`DebugSessionController`], which claims a port in
//! the process-wide [`PortClaimRegistry`], establishes a [`SessionTransport`]
//! (listening or dialing out), swaps the process console onto the socket and
//! hands it to a [`ReplEngine`]. A terminal command tears everything down.
//!
//! [`SessionBroker`] is the other side for active sessions: one operator
//! console multiplexed across many attached debuggees.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpdb_core::{BasicEngine, DebugConfig, DebugSessionController, Frame};
//!
//! # async fn example() -> rpdb_core::Result<()> {
//! let config = DebugConfig::load()?;
//! let controller = DebugSessionController::new(config, Arc::new(BasicEngine::factory()));
//! let outcome = controller.set_trace(Frame::here("main")).await;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod console;
pub mod controller;
pub mod engine;
pub mod error;
pub mod probe;
pub mod registry;
pub mod transport;

pub use broker::SessionBroker;
pub use config::{BrokerConfig, DebugConfig};
pub use console::{Console, ConsoleHandle};
pub use controller::{ControllerState, DebugSessionController, SessionOutcome};
pub use engine::{
    BasicEngine, EngineFactory, EntryPoint, Frame, ReplEngine, Terminal, TerminalAdapter,
    Traceback,
};
pub use error::{DebugError, Result};
pub use probe::PortProbe;
pub use registry::{OwnerToken, PortClaim, PortClaimRegistry};
pub use transport::{SessionTransport, TransportMode, TransportState};
