//! Process-wide table of ports claimed for debugging.
//!
//! The same lock serializes installing a console over the process stdio, so
//! claim bookkeeping and redirection never interleave between two transports.
//! Taking back the displaced streams happens after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::console::{Console, ConsoleHandle};
use crate::error::{DebugError, Result};

/// Identity of a session owner.
///
/// All callers sharing one controller share its token; that is what makes a
/// second `set_trace` on a held port a recurrence rather than a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A port held by a session. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClaim {
    pub port: u16,
    pub owner: OwnerToken,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    claims: HashMap<u16, PortClaim>,
    /// Transport currently holding the process console.
    stdio_holder: Option<Uuid>,
}

/// Thread-safe port → owner mapping plus the process console it guards.
pub struct PortClaimRegistry {
    state: Mutex<RegistryState>,
    stdio: ConsoleHandle,
}

impl fmt::Debug for PortClaimRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortClaimRegistry").field("stdio", &self.stdio).finish_non_exhaustive()
    }
}

impl PortClaimRegistry {
    /// Registry whose "process console" is `stdio`.
    pub fn new(stdio: ConsoleHandle) -> Self {
        Self { state: Mutex::new(RegistryState::default()), stdio }
    }

    /// The registry shared by the whole process, backed by real stdin/stdout.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<PortClaimRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(ConsoleHandle::process()))))
    }

    /// The process console. Writes follow any active redirection.
    pub fn stdio(&self) -> &ConsoleHandle {
        &self.stdio
    }

    /// Install or overwrite the claim on `port` (last writer wins).
    pub async fn claim(&self, port: u16, owner: OwnerToken) {
        let mut state = self.state.lock().await;
        Self::insert_claim(&mut state, port, owner);
    }

    pub async fn is_claimed(&self, port: u16) -> bool {
        self.state.lock().await.claims.contains_key(&port)
    }

    pub async fn is_claimed_by(&self, port: u16, owner: OwnerToken) -> bool {
        self.state.lock().await.claims.get(&port).is_some_and(|claim| claim.owner == owner)
    }

    pub async fn get(&self, port: u16) -> Option<PortClaim> {
        self.state.lock().await.claims.get(&port).cloned()
    }

    /// Remove the claim on `port`. Absent keys are a no-op.
    pub async fn unclaim(&self, port: u16) {
        if self.state.lock().await.claims.remove(&port).is_some() {
            debug!(port, "Released port claim");
        }
    }

    /// Run `bind` and record the claim within one critical section.
    ///
    /// `bind` returns the bound resource and the port it actually got (they
    /// differ when `port` is 0). Fails with `RecurrentInvocation` before
    /// binding when `owner` already holds the port, and maps a failed bind to
    /// `AddressInUse`.
    pub(crate) async fn bind_claimed<T>(
        &self,
        port: u16,
        owner: OwnerToken,
        bind: impl FnOnce() -> std::io::Result<(T, u16)>,
    ) -> Result<(T, u16)> {
        let mut state = self.state.lock().await;
        if state.claims.get(&port).is_some_and(|claim| claim.owner == owner) {
            return Err(DebugError::RecurrentInvocation { port });
        }
        match bind() {
            Ok((bound, actual)) => {
                Self::insert_claim(&mut state, actual, owner);
                Ok((bound, actual))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                Err(DebugError::AddressInUse { port })
            }
            Err(e) => Err(DebugError::Io(e)),
        }
    }

    /// Swap `console` into the process console if no other transport holds it.
    ///
    /// Returns the displaced console on success, or gives `console` back
    /// unchanged when the process console is already redirected.
    pub(crate) async fn redirect_stdio(
        &self,
        transport: Uuid,
        console: Console,
    ) -> std::result::Result<Console, Console> {
        let retired = {
            let mut state = self.state.lock().await;
            if let Some(holder) = state.stdio_holder {
                warn!(%holder, %transport, "Process stdio already redirected, session keeps a private console");
                return Err(console);
            }
            state.stdio_holder = Some(transport);
            self.stdio.install(console)
        };
        Ok(retired.into_console().await)
    }

    /// Put `saved` back as the process console and return the session's streams.
    pub(crate) async fn restore_stdio(&self, transport: Uuid, saved: Console) -> Console {
        let retired = {
            let mut state = self.state.lock().await;
            if state.stdio_holder == Some(transport) {
                state.stdio_holder = None;
            }
            self.stdio.install(saved)
        };
        retired.into_console().await
    }

    fn insert_claim(state: &mut RegistryState, port: u16, owner: OwnerToken) {
        let claim = PortClaim { port, owner, created_at: Utc::now() };
        if let Some(previous) = state.claims.insert(port, claim) {
            debug!(port, previous = %previous.owner, %owner, "Replaced port claim");
        }
    }
}
