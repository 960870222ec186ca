//! Multi-session console relay.
//!
//! Many debuggees (usually in active mode) dial into one broker. Each
//! session gets a one-letter label; every line a session prints is shown on
//! the operator console, and operator input goes to the session at the front
//! of the list. `/switch` rotates the list.
//!
//! Each session has its own writer task, so a peer that stops reading only
//! backs up its own queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::Result;

/// Session labels, handed out in order and reused cyclically.
pub const LABEL_ALPHABET: &str = "ABCDEFGHJKLMNOPRSTUWVXYZ";
/// Console command that rotates the session list.
pub const SWITCH_COMMAND: &str = "/switch";
/// Printed when input arrives with no session attached.
pub const NO_SESSION_MESSAGE: &str = "NO SESSION CONNECTED YET";
/// Printed before each console read.
pub const PROMPT: &str = "$ ";

type SharedOutput = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type SessionList = Arc<Mutex<VecDeque<BrokerSession>>>;

struct BrokerSession {
    id: u64,
    label: char,
    peer: SocketAddr,
    input: UnboundedSender<String>,
}

impl BrokerSession {
    fn name(&self) -> String {
        session_name(self.label, self.peer)
    }
}

fn session_name(label: char, peer: SocketAddr) -> String {
    format!("{}:{}", label, peer.port())
}

/// Accepts debuggee sessions and relays one operator console to them.
pub struct SessionBroker {
    listener: TcpListener,
    sessions: SessionList,
    labels: std::iter::Cycle<std::str::Chars<'static>>,
    next_id: u64,
}

impl std::fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBroker").field("listener", &self.listener).finish_non_exhaustive()
    }
}

impl SessionBroker {
    /// Listen on the configured address.
    pub async fn bind(config: &BrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.socket_addr()?).await?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            sessions: Arc::new(Mutex::new(VecDeque::new())),
            labels: LABEL_ALPHABET.chars().cycle(),
            next_id: 0,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires or `input` reaches end of file.
    pub async fn run<I, O>(mut self, input: I, output: O, shutdown: CancellationToken) -> Result<()>
    where
        I: AsyncBufRead + Send + Unpin,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let output: SharedOutput = Arc::new(Mutex::new(Box::new(output)));
        let address = self.local_addr()?;
        info!(%address, "Broker listening");
        say(&output, &format!("Serving on {address}\n")).await;
        say(&output, PROMPT).await;

        let mut console = input.lines();
        let mut relays = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Broker shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept session");
                            continue;
                        }
                    };
                    let id = self.next_id;
                    self.next_id += 1;
                    let label = self.labels.next().unwrap_or('?');
                    let (reader, writer) = stream.into_split();
                    let (input, queued) = mpsc::unbounded_channel();
                    let name = session_name(label, peer);

                    self.sessions.lock().await.push_back(BrokerSession { id, label, peer, input });
                    info!(%peer, %label, "Session connected");
                    say(&output, &format!("\n(Session {name} connected)\n")).await;

                    relays.spawn(forward(name.clone(), writer, queued));
                    relays.spawn(relay(
                        id,
                        name,
                        reader,
                        Arc::clone(&self.sessions),
                        Arc::clone(&output),
                    ));
                }
                line = console.next_line() => {
                    match line? {
                        Some(line) => {
                            self.handle_line(&line, &output).await;
                            say(&output, PROMPT).await;
                        }
                        None => {
                            info!("Console input closed");
                            break;
                        }
                    }
                }
                Some(finished) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Session relay task failed");
                    }
                }
            }
        }

        relays.shutdown().await;
        self.sessions.lock().await.clear();
        Ok(())
    }

    async fn handle_line(&self, line: &str, output: &SharedOutput) {
        if line.trim().is_empty() {
            return;
        }

        if line.trim() == SWITCH_COMMAND {
            let current = {
                let mut sessions = self.sessions.lock().await;
                let len = sessions.len();
                sessions.rotate_left(1.min(len));
                sessions.front().map(BrokerSession::name)
            };
            match current {
                Some(name) => {
                    debug!(session = %name, "Switched session");
                    say(output, &format!("(switched to {name})\n")).await;
                }
                None => say(output, &format!("{NO_SESSION_MESSAGE}\n")).await,
            }
            return;
        }

        let queued = {
            let sessions = self.sessions.lock().await;
            sessions.front().map(|current| (current.name(), current.input.send(format!("{line}\n"))))
        };
        match queued {
            Some((_, Ok(()))) => {}
            Some((name, Err(_))) => warn!(session = %name, "Session writer gone, input dropped"),
            None => say(output, &format!("{NO_SESSION_MESSAGE}\n")).await,
        }
    }
}

/// Write queued operator input to one session until it goes away.
async fn forward(name: String, mut writer: OwnedWriteHalf, mut queued: UnboundedReceiver<String>) {
    while let Some(line) = queued.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(session = %name, error = %e, "Failed to forward input");
            break;
        }
    }
}

/// Print each line the session sends, then drop the session on EOF.
///
/// Bytes are shown as-is; anything that is not UTF-8 is rendered lossily.
async fn relay(
    id: u64,
    name: String,
    reader: OwnedReadHalf,
    sessions: SessionList,
    output: SharedOutput,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                say(&output, &format!("{name}: {line}\n")).await;
            }
            Err(e) => {
                debug!(session = %name, error = %e, "Session read failed");
                break;
            }
        }
    }

    sessions.lock().await.retain(|session| session.id != id);
    info!(session = %name, "Session closed");
    say(&output, &format!("(Session {name} closed)\n")).await;
}

async fn say(output: &SharedOutput, text: &str) {
    let mut output = output.lock().await;
    let written = match output.write_all(text.as_bytes()).await {
        Ok(()) => output.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        debug!(error = %e, "Console output failed");
    }
}
