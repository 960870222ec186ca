//! The process console as an injectable, swappable stream pair.
//!
//! Redirecting "stdin/stdout onto the socket" is modelled by installing new
//! streams behind a shared [`ConsoleHandle`]. Everything that reads or writes
//! through the handle follows the swap, so I/O performed while a session is
//! attached reaches the remote operator.
//!
//! Installing never waits on the streams: the outgoing pair is retired, and
//! a read pending on it abandons the old stream and continues on the new one.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Line-buffered input half of a console.
pub type ConsoleReader = Box<dyn AsyncBufRead + Send + Unpin>;
/// Output half of a console.
pub type ConsoleWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An owned input/output stream pair.
pub struct Console {
    pub reader: ConsoleReader,
    pub writer: ConsoleWriter,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Console {
    /// Wrap any reader/writer pair; the reader gets its own line buffer.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self { reader: Box::new(BufReader::new(reader)), writer: Box::new(writer) }
    }

    /// The real process stdin/stdout.
    pub fn process() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

/// One installed stream pair. The streams are taken out when it is retired.
struct Slot {
    reader: Mutex<Option<ConsoleReader>>,
    writer: Mutex<Option<ConsoleWriter>>,
    retired: CancellationToken,
}

impl Slot {
    fn new(console: Console) -> Arc<Self> {
        Arc::new(Self {
            reader: Mutex::new(Some(console.reader)),
            writer: Mutex::new(Some(console.writer)),
            retired: CancellationToken::new(),
        })
    }
}

/// A stream pair that has been replaced but not yet handed back.
pub(crate) struct Retired {
    slot: Arc<Slot>,
}

impl Retired {
    /// Wait for in-flight I/O on the old pair to let go, then take it.
    pub(crate) async fn into_console(self) -> Console {
        let reader = self.slot.reader.lock().await.take();
        let writer = self.slot.writer.lock().await.take();
        let mut writer: ConsoleWriter = writer.unwrap_or_else(|| Box::new(tokio::io::sink()));
        // Pending buffered output belongs to the outgoing console.
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "Ignoring flush error on retired console");
        }
        Console { reader: reader.unwrap_or_else(|| Box::new(tokio::io::empty())), writer }
    }
}

/// Shared reference to "the current console".
///
/// Reader and writer are locked independently so output is not held up by a
/// pending line read.
#[derive(Clone)]
pub struct ConsoleHandle {
    current: Arc<RwLock<Arc<Slot>>>,
}

impl fmt::Debug for ConsoleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleHandle").finish_non_exhaustive()
    }
}

impl ConsoleHandle {
    pub fn new(console: Console) -> Self {
        Self { current: Arc::new(RwLock::new(Slot::new(console))) }
    }

    /// Handle over the real process stdin/stdout.
    pub fn process() -> Self {
        Self::new(Console::process())
    }

    fn slot(&self) -> Arc<Slot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Read one line including its terminator. `None` means end of input.
    ///
    /// A read pending when the console is swapped moves to the new input; a
    /// partially received line from the old input is dropped.
    pub async fn read_line(&self) -> std::io::Result<Option<String>> {
        loop {
            let slot = self.slot();
            let read = async {
                let mut reader = slot.reader.lock().await;
                let Some(reader) = reader.as_mut() else {
                    return None;
                };
                let mut line = String::new();
                Some(reader.read_line(&mut line).await.map(|read| (read > 0).then_some(line)))
            };
            tokio::select! {
                biased;
                () = slot.retired.cancelled() => {}
                result = read => {
                    if let Some(result) = result {
                        return result;
                    }
                }
            }
        }
    }

    /// Write raw bytes and flush.
    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        loop {
            let slot = self.slot();
            let mut writer = slot.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                writer.write_all(bytes).await?;
                return writer.flush().await;
            }
        }
    }

    pub async fn write_str(&self, text: &str) -> std::io::Result<()> {
        self.write_all(text.as_bytes()).await
    }

    pub async fn flush(&self) -> std::io::Result<()> {
        match self.slot().writer.lock().await.as_mut() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// Half-close the output side.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        match self.slot().writer.lock().await.as_mut() {
            Some(writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    /// Make `console` current without waiting on the outgoing streams.
    pub(crate) fn install(&self, console: Console) -> Retired {
        let slot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Slot::new(console))
        };
        slot.retired.cancel();
        Retired { slot }
    }
}
