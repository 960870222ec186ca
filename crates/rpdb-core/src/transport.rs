//! One TCP debugging transport: establishment, stdio redirection, teardown.
//!
//! Lifecycle: `Unbound → Bound | Connecting → Established → TornDown`.
//! Teardown is idempotent and always runs in the same order: restore stdio,
//! half-close and close the socket, release the port claim.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::console::{Console, ConsoleHandle};
use crate::error::{DebugError, Result};
use crate::registry::{OwnerToken, PortClaimRegistry};

/// Listen backlog for passive transports: one operator per session.
const LISTEN_BACKLOG: u32 = 1;

/// Which side initiates the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Listen and wait for an operator to connect.
    Passive,
    /// Dial out to a waiting broker or operator.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unbound,
    Bound,
    Connecting,
    Established,
    TornDown,
}

/// Everything a transport must give back, detached from `self` so `Drop` can
/// hand it to a background task.
#[derive(Default)]
struct Held {
    saved_stdio: Option<Console>,
    private_io: Option<ConsoleHandle>,
    listener: Option<TcpListener>,
    claimed_port: Option<u16>,
}

impl Held {
    fn is_empty(&self) -> bool {
        self.saved_stdio.is_none()
            && self.private_io.is_none()
            && self.listener.is_none()
            && self.claimed_port.is_none()
    }

    async fn release(mut self, id: Uuid, registry: &PortClaimRegistry) {
        if let Some(saved) = self.saved_stdio.take() {
            // Restore first so anything logged below reaches the pre-session console.
            let mut session = registry.restore_stdio(id, saved).await;
            if let Err(e) = session.writer.shutdown().await.map_err(DebugError::Teardown) {
                debug!(error = %e, "Ignoring socket shutdown error");
            }
        }
        if let Some(io) = self.private_io.take() {
            if let Err(e) = io.shutdown().await.map_err(DebugError::Teardown) {
                debug!(error = %e, "Ignoring socket shutdown error");
            }
        }
        drop(self.listener.take());
        if let Some(port) = self.claimed_port.take() {
            registry.unclaim(port).await;
        }
    }
}

/// A single debugging connection and the process state it borrows.
pub struct SessionTransport {
    id: Uuid,
    mode: TransportMode,
    address: SocketAddr,
    owner: OwnerToken,
    registry: Arc<PortClaimRegistry>,
    state: TransportState,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    io: Option<ConsoleHandle>,
    held: Held,
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SessionTransport {
    /// Create an `Unbound` transport.
    pub fn new(
        mode: TransportMode,
        address: SocketAddr,
        owner: OwnerToken,
        registry: Arc<PortClaimRegistry>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            address,
            owner,
            registry,
            state: TransportState::Unbound,
            peer: None,
            local: None,
            io: None,
            held: Held::default(),
        }
    }

    /// Bind and listen, then wait for exactly one operator.
    pub async fn passive(
        address: SocketAddr,
        owner: OwnerToken,
        registry: Arc<PortClaimRegistry>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut transport = Self::new(TransportMode::Passive, address, owner, registry);
        transport.bind().await?;
        info!(address = %transport.local_addr().unwrap_or(address), "rpdb waiting for an operator");
        if let Err(e) = transport.accept(cancel).await {
            transport.teardown().await;
            return Err(e);
        }
        Ok(transport)
    }

    /// Dial out and establish.
    pub async fn active(
        address: SocketAddr,
        owner: OwnerToken,
        registry: Arc<PortClaimRegistry>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut transport = Self::new(TransportMode::Active, address, owner, registry);
        info!(%address, "rpdb tries to connect to {}", address);
        if let Err(e) = transport.connect(cancel).await {
            transport.teardown().await;
            return Err(e);
        }
        Ok(transport)
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// Remote end once established.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bound listening address (passive) once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Whether this transport holds the process console.
    pub fn redirected_stdio(&self) -> bool {
        self.held.saved_stdio.is_some()
    }

    /// The stream the REPL engine talks through.
    pub fn io(&self) -> Option<ConsoleHandle> {
        self.io.clone()
    }

    /// `Unbound → Bound`: bind with address reuse and listen with backlog 1,
    /// recording the port claim in the same critical section.
    pub async fn bind(&mut self) -> Result<()> {
        self.expect_state(TransportState::Unbound, "bind")?;
        let address = self.address;
        let (listener, port) = self
            .registry
            .bind_claimed(address.port(), self.owner, || {
                let socket =
                    if address.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
                socket.set_reuseaddr(true)?;
                socket.bind(address)?;
                let listener = socket.listen(LISTEN_BACKLOG)?;
                let port = listener.local_addr()?.port();
                Ok((listener, port))
            })
            .await?;

        self.local = listener.local_addr().ok();
        self.held.listener = Some(listener);
        self.held.claimed_port = Some(port);
        self.state = TransportState::Bound;
        debug!(port, owner = %self.owner, "Bound debugging port");
        Ok(())
    }

    /// `Bound → Established`: wait for one operator or cancellation.
    pub async fn accept(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.expect_state(TransportState::Bound, "accept")?;
        let listener = self
            .held
            .listener
            .as_ref()
            .ok_or_else(|| DebugError::Config("bound transport without listener".to_string()))?;

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            () = cancel.cancelled() => return Err(DebugError::Cancelled),
        };
        self.establish(stream, peer).await
    }

    /// `Unbound → Connecting → Established`. Not retried on failure.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.expect_state(TransportState::Unbound, "connect")?;
        self.state = TransportState::Connecting;
        let address = self.address;

        let stream = tokio::select! {
            connected = TcpStream::connect(address) => connected
                .map_err(|source| DebugError::ConnectFailed { address, source })?,
            () = cancel.cancelled() => return Err(DebugError::Cancelled),
        };
        self.establish(stream, address).await
    }

    async fn establish(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let console = Console::new(read_half, write_half);

        let io = match self.registry.redirect_stdio(self.id, console).await {
            Ok(saved) => {
                self.held.saved_stdio = Some(saved);
                self.registry.stdio().clone()
            }
            Err(console) => {
                let private = ConsoleHandle::new(console);
                self.held.private_io = Some(private.clone());
                private
            }
        };

        self.io = Some(io);
        self.peer = Some(peer);
        self.state = TransportState::Established;
        info!(%peer, mode = ?self.mode, redirected = self.redirected_stdio(), "Debug session established");
        Ok(())
    }

    /// Restore stdio, close the socket, release the claim. Safe to repeat.
    pub async fn teardown(&mut self) {
        if self.state == TransportState::TornDown {
            return;
        }
        self.io = None;
        let held = std::mem::take(&mut self.held);
        held.release(self.id, &self.registry).await;
        self.state = TransportState::TornDown;
        debug!(peer = ?self.peer, "Debug session torn down");
    }

    fn expect_state(&self, expected: TransportState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DebugError::Config(format!(
                "cannot {} a transport in state {:?}",
                operation, self.state
            )))
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        if self.state == TransportState::TornDown || self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(%id, "Transport dropped without teardown, releasing in background");
                handle.spawn(async move { held.release(id, &registry).await });
            }
            Err(_) => warn!(%id, "Transport dropped outside a runtime, resources leaked"),
        }
    }
}
