//! Debuggee-side entry points.
//!
//! A [`DebugSessionController`] acquires a transport (retrying a busy port
//! within bounds), hands its console to a REPL engine and guarantees teardown.
//! Nothing here returns an error to the caller: every failure is logged and
//! folded into a [`SessionOutcome`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DebugConfig;
use crate::engine::{EngineFactory, EntryPoint, Frame, Terminal, TerminalAdapter, Traceback};
use crate::error::{DebugError, Result};
use crate::probe::PortProbe;
use crate::registry::{OwnerToken, PortClaimRegistry};
use crate::transport::{SessionTransport, TransportMode};

/// Message written to the process console when a session re-enters itself.
pub const RECURRENT_MESSAGE: &str = "(Recurrent rpdb invocation ignored)\n";

/// How a debugging request ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// A session ran and was closed by a terminal command.
    Detached(Terminal),
    /// This controller already holds the port; nothing was done.
    Recurrent,
    /// No session could be established; the program continues undebugged.
    Unavailable(DebugError),
    /// The engine failed while attached; the session was torn down.
    EngineFailed(DebugError),
}

impl SessionOutcome {
    /// Whether an operator was actually attached.
    pub fn attached(&self) -> bool {
        matches!(self, Self::Detached(_) | Self::EngineFailed(_))
    }
}

/// Aggregate state of every call running on one controller.
///
/// The most advanced stage any call has reached wins: a controller with one
/// attached session and one call still acquiring reports `Attached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Acquiring,
    Attached,
    ShuttingDown,
    Closed,
}

/// Glues transports to REPL engines for one owner identity.
///
/// Clones of an `Arc<DebugSessionController>` shared across tasks share the
/// owner token, so a second `set_trace` on a port this controller already
/// holds is reported as [`SessionOutcome::Recurrent`].
pub struct DebugSessionController {
    config: DebugConfig,
    owner: OwnerToken,
    registry: Arc<PortClaimRegistry>,
    factory: Arc<dyn EngineFactory>,
    activity: Mutex<Activity>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for DebugSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSessionController")
            .field("config", &self.config)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DebugSessionController {
    /// Controller over the process-wide registry.
    pub fn new(config: DebugConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_registry(config, PortClaimRegistry::global(), factory)
    }

    pub fn with_registry(
        config: DebugConfig,
        registry: Arc<PortClaimRegistry>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            config,
            owner: OwnerToken::new(),
            registry,
            factory,
            activity: Mutex::new(Activity::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub fn registry(&self) -> &Arc<PortClaimRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ControllerState {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner).state()
    }

    /// Abort any accept, connect or retry wait currently in progress.
    ///
    /// Later calls are unaffected.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *token, CancellationToken::new()).cancel();
    }

    /// Listen on `address:port` and stop at the caller's location.
    #[track_caller]
    pub fn start<'a>(
        &'a self,
        address: &'a str,
        port: u16,
    ) -> impl Future<Output = SessionOutcome> + Send + 'a {
        let frame = Frame::here("start");
        let config = self.config.clone().with_endpoint(address, port);
        async move { self.run(TransportMode::Passive, config, EntryPoint::Frame(frame)).await }
    }

    /// Listen on the configured endpoint and stop at `frame`.
    pub async fn set_trace(&self, frame: Frame) -> SessionOutcome {
        self.run(TransportMode::Passive, self.config.clone(), EntryPoint::Frame(frame)).await
    }

    /// Dial the configured endpoint (usually a broker) and stop at `frame`.
    pub async fn set_trace_active(&self, frame: Frame) -> SessionOutcome {
        self.run(TransportMode::Active, self.config.clone(), EntryPoint::Frame(frame)).await
    }

    /// Listen on the configured endpoint seeded with a captured failure.
    pub async fn post_mortem(&self, traceback: Traceback) -> SessionOutcome {
        self.run(TransportMode::Passive, self.config.clone(), EntryPoint::PostMortem(traceback))
            .await
    }

    /// Enter `set_trace` whenever the process receives SIGTRAP.
    #[cfg(unix)]
    pub fn handle_trap(self: Arc<Self>) -> std::io::Result<tokio::task::JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        // SIGTRAP is 5 on Linux and macOS.
        const SIGTRAP: i32 = 5;
        let mut trap = signal(SignalKind::from_raw(SIGTRAP))?;
        Ok(tokio::spawn(async move {
            while trap.recv().await.is_some() {
                info!("SIGTRAP received, entering debugger");
                let outcome = self.set_trace(Frame::here("SIGTRAP")).await;
                debug!(?outcome, "SIGTRAP session finished");
            }
        }))
    }

    async fn run(&self, mode: TransportMode, config: DebugConfig, entry: EntryPoint) -> SessionOutcome {
        self.update(|activity| activity.acquiring += 1);
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let transport = match self.acquire(mode, &config, &cancel).await {
            Ok(transport) => transport,
            Err(DebugError::RecurrentInvocation { port }) => {
                info!(port, owner = %self.owner, "Recurrent rpdb invocation ignored");
                if let Err(e) = self.registry.stdio().write_str(RECURRENT_MESSAGE).await {
                    debug!(error = %e, "Could not report recurrence on the console");
                }
                self.update(|activity| activity.acquiring = activity.acquiring.saturating_sub(1));
                return SessionOutcome::Recurrent;
            }
            Err(e) => {
                error!(error = %e, mode = ?mode, "Debugging unavailable, continuing without a session");
                self.update(Activity::abandon);
                return SessionOutcome::Unavailable(e);
            }
        };

        let Some(io) = transport.io() else {
            let mut transport = transport;
            transport.teardown().await;
            self.update(Activity::abandon);
            return SessionOutcome::Unavailable(DebugError::ConsoleClosed);
        };

        self.update(|activity| {
            activity.acquiring = activity.acquiring.saturating_sub(1);
            activity.attached += 1;
        });
        let engine = self.factory.create(io);
        let adapter = TerminalAdapter::new(engine, transport);
        let result = adapter
            .run(&entry, || {
                self.update(|activity| {
                    activity.attached = activity.attached.saturating_sub(1);
                    activity.shutting_down += 1;
                });
            })
            .await;
        self.update(|activity| {
            activity.shutting_down = activity.shutting_down.saturating_sub(1);
            activity.closed = true;
        });

        match result {
            Ok(terminal) => {
                info!(%terminal, "Debug session closed");
                SessionOutcome::Detached(terminal)
            }
            Err(e) => {
                error!(error = %e, "REPL engine failed, session torn down");
                SessionOutcome::EngineFailed(e)
            }
        }
    }

    async fn acquire(
        &self,
        mode: TransportMode,
        config: &DebugConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionTransport> {
        match mode {
            TransportMode::Active => {
                let address = config.socket_addr()?;
                SessionTransport::active(address, self.owner, Arc::clone(&self.registry), cancel)
                    .await
            }
            TransportMode::Passive => {
                let address = self.resolve_port(config).await?;
                self.acquire_passive(address, config, cancel).await
            }
        }
    }

    /// Apply port search unless this owner already holds the configured port.
    async fn resolve_port(&self, config: &DebugConfig) -> Result<SocketAddr> {
        let mut address = config.socket_addr()?;
        if config.port_search && !self.registry.is_claimed_by(config.port, self.owner).await {
            let probe = PortProbe::new(config.probe_timeout());
            let port =
                probe.find_available_port(&config.address, config.port, config.search_window).await?;
            if port != config.port {
                info!(requested = config.port, port, "Configured port busy, using next free port");
            }
            address.set_port(port);
        }
        Ok(address)
    }

    async fn acquire_passive(
        &self,
        address: SocketAddr,
        config: &DebugConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionTransport> {
        let deadline = Instant::now() + config.retry_timeout();
        let interval = config.retry_interval();

        loop {
            let registry = Arc::clone(&self.registry);
            match SessionTransport::passive(address, self.owner, registry, cancel).await {
                Err(e) if e.is_address_in_use() => {
                    let port = address.port();
                    if self.registry.is_claimed_by(port, self.owner).await {
                        return Err(DebugError::RecurrentInvocation { port });
                    }
                    if Instant::now() + interval > deadline {
                        warn!(
                            port,
                            timeout_secs = config.retry_timeout_secs,
                            "Port still in use, giving up"
                        );
                        return Err(e);
                    }
                    warn!(port, retry_in_secs = interval.as_secs(), "Port in use, retrying");
                    tokio::select! {
                        () = sleep(interval) => {}
                        () = cancel.cancelled() => return Err(DebugError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    fn update(&self, change: impl FnOnce(&mut Activity)) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        let from = activity.state();
        change(&mut activity);
        let to = activity.state();
        if from != to {
            debug!(?from, ?to, "Controller state change");
        }
    }
}

/// Number of calls in each stage, plus whether any session has ended.
#[derive(Debug, Default)]
struct Activity {
    acquiring: usize,
    attached: usize,
    shutting_down: usize,
    closed: bool,
}

impl Activity {
    fn state(&self) -> ControllerState {
        if self.shutting_down > 0 {
            ControllerState::ShuttingDown
        } else if self.attached > 0 {
            ControllerState::Attached
        } else if self.acquiring > 0 {
            ControllerState::Acquiring
        } else if self.closed {
            ControllerState::Closed
        } else {
            ControllerState::Idle
        }
    }

    /// An acquiring call gave up without attaching.
    fn abandon(&mut self) {
        self.acquiring = self.acquiring.saturating_sub(1);
        self.closed = true;
    }
}
