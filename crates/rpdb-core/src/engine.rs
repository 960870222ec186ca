//! The REPL engine seam.
//!
//! The command interpreter is external; rpdb only needs to hand it a console
//! and to know which of its commands end the session. [`TerminalAdapter`]
//! owns the transport for the duration of one session and tears it down
//! exactly once, whatever the engine does.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, Location};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::debug;

use crate::console::ConsoleHandle;
use crate::error::{DebugError, Result};
use crate::transport::SessionTransport;

/// A command that ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Let the debuggee continue.
    Resume,
    /// Stop debugging.
    Abort,
    /// The operator's input stream closed.
    EndOfInput,
}

impl Terminal {
    pub const RESUME_COMMANDS: &'static [&'static str] = &["c", "cont", "continue"];
    pub const ABORT_COMMANDS: &'static [&'static str] = &["q", "quit", "exit"];
    pub const END_OF_INPUT_COMMAND: &'static str = "EOF";

    /// Map a command line to the terminal command it names, if any.
    pub fn from_command(line: &str) -> Option<Self> {
        let name = line.split_whitespace().next()?;
        if Self::RESUME_COMMANDS.contains(&name) {
            Some(Self::Resume)
        } else if Self::ABORT_COMMANDS.contains(&name) {
            Some(Self::Abort)
        } else if name == Self::END_OF_INPUT_COMMAND {
            Some(Self::EndOfInput)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "continue",
            Self::Abort => "quit",
            Self::EndOfInput => "EOF",
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live execution point handed to `set_trace`.
#[derive(Debug, Clone)]
pub struct Frame {
    label: String,
    location: &'static Location<'static>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Capture the caller's source location.
    #[track_caller]
    pub fn here(label: impl Into<String>) -> Self {
        Self { label: label.into(), location: Location::caller(), captured_at: Utc::now() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    pub fn line(&self) -> u32 {
        self.location.line()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file(), self.line(), self.label)
    }
}

/// A captured error and its chain of causes, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceback {
    chain: Vec<String>,
}

impl Traceback {
    pub fn capture(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self { chain }
    }

    /// Traceback of an `anyhow` error, keeping its context layers.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self { chain: error.chain().map(ToString::to_string).collect() }
    }

    pub fn message(&self) -> &str {
        self.chain.first().map_or("", String::as_str)
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Traceback (outermost first):")?;
        for (depth, entry) in self.chain.iter().enumerate() {
            write!(f, "\n  {depth}: {entry}")?;
        }
        Ok(())
    }
}

/// Where the engine takes over.
#[derive(Debug, Clone)]
pub enum EntryPoint {
    Frame(Frame),
    PostMortem(Traceback),
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(frame) => write!(f, "> {frame}"),
            Self::PostMortem(traceback) => write!(f, "{traceback}"),
        }
    }
}

/// A line-oriented command interpreter attached to one session.
#[async_trait]
pub trait ReplEngine: Send {
    /// Run the command loop until a terminal command ends it.
    async fn interact(&mut self, entry: &EntryPoint) -> anyhow::Result<Terminal>;

    /// Perform the terminal command's own behavior.
    async fn terminate(&mut self, terminal: Terminal) -> anyhow::Result<()>;
}

/// Builds an engine around the session console.
pub trait EngineFactory: Send + Sync {
    fn create(&self, io: ConsoleHandle) -> Box<dyn ReplEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(ConsoleHandle) -> Box<dyn ReplEngine> + Send + Sync,
{
    fn create(&self, io: ConsoleHandle) -> Box<dyn ReplEngine> {
        self(io)
    }
}

/// Runs an engine over a transport and always releases the transport.
pub struct TerminalAdapter {
    engine: Box<dyn ReplEngine>,
    transport: SessionTransport,
}

impl fmt::Debug for TerminalAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalAdapter").field("transport", &self.transport).finish_non_exhaustive()
    }
}

impl TerminalAdapter {
    pub fn new(engine: Box<dyn ReplEngine>, transport: SessionTransport) -> Self {
        Self { engine, transport }
    }

    /// Interact, run the terminal command, then tear down.
    ///
    /// Engine errors and panics become `EngineFailure`; `on_shutdown` runs
    /// right before teardown in every case.
    pub async fn run(mut self, entry: &EntryPoint, on_shutdown: impl FnOnce() + Send) -> Result<Terminal> {
        let result = match AssertUnwindSafe(self.engine.interact(entry)).catch_unwind().await {
            Ok(Ok(terminal)) => {
                debug!(%terminal, "Terminal command issued");
                match AssertUnwindSafe(self.engine.terminate(terminal)).catch_unwind().await {
                    Ok(Ok(())) => Ok(terminal),
                    Ok(Err(e)) => Err(DebugError::EngineFailure(format!("{e:#}"))),
                    Err(panic) => Err(DebugError::EngineFailure(panic_message(panic.as_ref()))),
                }
            }
            Ok(Err(e)) => Err(DebugError::EngineFailure(format!("{e:#}"))),
            Err(panic) => Err(DebugError::EngineFailure(panic_message(panic.as_ref()))),
        };

        on_shutdown();
        self.transport.teardown().await;
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("engine panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("engine panicked: {message}")
    } else {
        "engine panicked".to_string()
    }
}

const BASIC_PROMPT: &str = "(Rpdb) ";

const BASIC_HELP: &str = "\
Documented commands:
  w(here)              print the current entry point
  h(elp)               show this list
  c(ont(inue))         resume the program and close the session
  q(uit), exit         stop debugging and close the session
";

/// Minimal engine: reports where it stopped and waits for a terminal command.
#[derive(Debug)]
pub struct BasicEngine {
    io: ConsoleHandle,
}

impl BasicEngine {
    pub fn new(io: ConsoleHandle) -> Self {
        Self { io }
    }

    /// Factory for controllers.
    pub fn factory() -> impl EngineFactory {
        |io: ConsoleHandle| -> Box<dyn ReplEngine> { Box::new(Self::new(io)) }
    }
}

#[async_trait]
impl ReplEngine for BasicEngine {
    async fn interact(&mut self, entry: &EntryPoint) -> anyhow::Result<Terminal> {
        self.io.write_str(&format!("{entry}\n")).await?;
        loop {
            self.io.write_str(BASIC_PROMPT).await?;
            let Some(line) = self.io.read_line().await? else {
                return Ok(Terminal::EndOfInput);
            };
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if let Some(terminal) = Terminal::from_command(command) {
                return Ok(terminal);
            }
            match command.split_whitespace().next().unwrap_or_default() {
                "w" | "where" => self.io.write_str(&format!("{entry}\n")).await?,
                "h" | "help" => self.io.write_str(BASIC_HELP).await?,
                other => self.io.write_str(&format!("*** Unknown command: {other}\n")).await?,
            }
        }
    }

    async fn terminate(&mut self, terminal: Terminal) -> anyhow::Result<()> {
        if terminal == Terminal::EndOfInput {
            // Keep the operator's terminal on a fresh line.
            self.io.write_str("\n").await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Console;
    use crate::registry::{OwnerToken, PortClaimRegistry};
    use crate::transport::{TransportMode, TransportState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};
    use tokio_util::sync::CancellationToken;

    fn memory_console() -> (ConsoleHandle, tokio::io::DuplexStream) {
        let (remote, local) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        (ConsoleHandle::new(Console::new(reader, writer)), remote)
    }

    #[test]
    fn test_terminal_command_table() {
        for name in ["c", "cont", "continue"] {
            assert_eq!(Terminal::from_command(name), Some(Terminal::Resume));
        }
        for name in ["q", "quit", "exit"] {
            assert_eq!(Terminal::from_command(name), Some(Terminal::Abort));
        }
        assert_eq!(Terminal::from_command("EOF"), Some(Terminal::EndOfInput));
        assert_eq!(Terminal::from_command("  c  \n"), Some(Terminal::Resume));
        assert_eq!(Terminal::from_command("next"), None);
        assert_eq!(Terminal::from_command(""), None);
    }

    #[test]
    fn test_frame_captures_caller() {
        let frame = Frame::here("worker");
        assert_eq!(frame.label(), "worker");
        assert!(frame.file().ends_with("engine.rs"));
        assert!(frame.to_string().contains("in worker"));
    }

    #[test]
    fn test_traceback_chain() {
        let inner = std::io::Error::other("disk full");
        let outer = DebugError::Teardown(inner);
        let traceback = Traceback::capture(&outer);
        assert_eq!(traceback.message(), "Teardown error: disk full");

        let error = anyhow::anyhow!("root cause").context("while saving");
        let traceback = Traceback::from_anyhow(&error);
        assert_eq!(traceback.chain(), ["while saving", "root cause"]);
        assert!(traceback.to_string().contains("1: root cause"));
    }

    #[tokio::test]
    async fn test_basic_engine_session() {
        let (io, remote) = memory_console();
        let (remote_read, mut remote_write) = tokio::io::split(remote);
        let mut engine = BasicEngine::new(io);

        remote_write.write_all(b"where\nbogus\n\ncont\n").await.unwrap();
        let entry = EntryPoint::Frame(Frame::here("main"));
        let terminal = engine.interact(&entry).await.unwrap();
        assert_eq!(terminal, Terminal::Resume);
        engine.terminate(terminal).await.unwrap();
        drop(engine);

        let mut lines = BufReader::new(remote_read).lines();
        let mut transcript = String::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            transcript.push_str(&line);
            transcript.push('\n');
        }
        assert!(transcript.contains("in main"));
        assert!(transcript.contains("*** Unknown command: bogus"));
    }

    #[tokio::test]
    async fn test_basic_engine_end_of_input() {
        let (io, mut remote) = memory_console();
        remote.shutdown().await.unwrap();
        let mut engine = BasicEngine::new(io);
        let entry = EntryPoint::PostMortem(Traceback::from_anyhow(&anyhow::anyhow!("boom")));
        assert_eq!(engine.interact(&entry).await.unwrap(), Terminal::EndOfInput);
        engine.terminate(Terminal::EndOfInput).await.unwrap();
    }

    struct PanickingEngine;

    #[async_trait]
    impl ReplEngine for PanickingEngine {
        async fn interact(&mut self, _entry: &EntryPoint) -> anyhow::Result<Terminal> {
            panic!("engine bug");
        }

        async fn terminate(&mut self, _terminal: Terminal) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn established_transport(registry: Arc<PortClaimRegistry>) -> (SessionTransport, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let transport =
            SessionTransport::active(address, OwnerToken::new(), registry, &CancellationToken::new())
                .await
                .unwrap();
        (transport, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_adapter_tears_down_after_panic() {
        let (stdio, _stdio_remote) = memory_console();
        let registry = Arc::new(PortClaimRegistry::new(stdio));
        let (transport, _peer) = established_transport(Arc::clone(&registry)).await;
        assert_eq!(transport.mode(), TransportMode::Active);
        assert_eq!(transport.state(), TransportState::Established);

        let shut_down = AtomicBool::new(false);
        let adapter = TerminalAdapter::new(Box::new(PanickingEngine), transport);
        let entry = EntryPoint::Frame(Frame::here("panic"));
        let err = adapter.run(&entry, || shut_down.store(true, Ordering::SeqCst)).await.unwrap_err();

        assert!(matches!(err, DebugError::EngineFailure(ref msg) if msg.contains("engine bug")));
        assert!(shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_adapter_runs_terminal_command() {
        let (stdio, _stdio_remote) = memory_console();
        let registry = Arc::new(PortClaimRegistry::new(stdio));
        let (transport, mut peer) = established_transport(Arc::clone(&registry)).await;

        peer.write_all(b"q\n").await.unwrap();
        let adapter = TerminalAdapter::new(
            BasicEngine::factory().create(registry.stdio().clone()),
            transport,
        );
        let terminal = adapter.run(&EntryPoint::Frame(Frame::here("quit")), || {}).await.unwrap();
        assert_eq!(terminal, Terminal::Abort);

        let mut transcript = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut peer, &mut transcript).await.unwrap();
        assert!(String::from_utf8_lossy(&transcript).contains("(Rpdb) "));
    }
}
