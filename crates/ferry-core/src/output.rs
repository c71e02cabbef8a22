//! Output and error streams of contexts.
//!
//! The engine writes into a [`ContextOutput`] on the context thread. Chunks
//! travel over a channel to a forwarder task on the host runtime, which hands
//! them to the host's [`OutputSink`]. Closing the context side ends the
//! forwarder once the buffered chunks are delivered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::ContextId;

/// Which stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Bytes written by a context.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Host-level aggregated sink for every context's output.
pub trait OutputSink: Send + Sync + 'static {
    fn write(&self, origin: ContextId, stream: OutputStream, bytes: &[u8]);

    fn flush(&self) {}
}

/// Writes context output to the process's own stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn write(&self, _origin: ContextId, stream: OutputStream, bytes: &[u8]) {
        let result = match stream {
            OutputStream::Stdout => std::io::stdout().lock().write_all(bytes),
            OutputStream::Stderr => std::io::stderr().lock().write_all(bytes),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to forward context {}: {}", stream, e);
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

/// Keeps everything written, per context and stream.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    captured: Arc<Mutex<HashMap<(ContextId, OutputStream), Vec<u8>>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything `origin` wrote to `stream` so far, lossily decoded.
    pub fn text(&self, origin: ContextId, stream: OutputStream) -> String {
        let captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        captured
            .get(&(origin, stream))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }

    /// Total bytes captured across all contexts and streams.
    pub fn total_bytes(&self) -> usize {
        let captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        captured.values().map(Vec::len).sum()
    }
}

impl OutputSink for CaptureSink {
    fn write(&self, origin: ContextId, stream: OutputStream, bytes: &[u8]) {
        let mut captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        captured
            .entry((origin, stream))
            .or_default()
            .extend_from_slice(bytes);
    }
}

/// Context-side writer. Lives on the context thread; cheap to clone.
#[derive(Clone)]
pub struct ContextOutput {
    tx: Rc<RefCell<Option<mpsc::UnboundedSender<OutputChunk>>>>,
}

impl ContextOutput {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OutputChunk>) -> Self {
        Self {
            tx: Rc::new(RefCell::new(Some(tx))),
        }
    }

    /// A writer whose output goes nowhere.
    pub fn detached() -> Self {
        Self {
            tx: Rc::new(RefCell::new(None)),
        }
    }

    pub fn write(&self, stream: OutputStream, bytes: impl Into<Vec<u8>>) {
        let tx = self.tx.borrow();
        match tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(OutputChunk {
                    stream,
                    bytes: bytes.into(),
                });
            }
            None => tracing::debug!("Dropping {} write on a closed context stream", stream),
        }
    }

    pub fn stdout(&self, text: &str) {
        self.write(OutputStream::Stdout, text.as_bytes());
    }

    pub fn stderr(&self, text: &str) {
        self.write(OutputStream::Stderr, text.as_bytes());
    }

    /// Close both streams. Later writes are dropped.
    pub fn close(&self) {
        self.tx.borrow_mut().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_none()
    }
}

/// Spawn the host-side task forwarding one context's output into `sink`.
///
/// The task ends when the context closes its output.
pub(crate) fn forward(
    origin: ContextId,
    mut rx: mpsc::UnboundedReceiver<OutputChunk>,
    sink: Arc<dyn OutputSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            sink.write(origin, chunk.stream, &chunk.bytes);
        }
        sink.flush();
        tracing::debug!("Output of context {} closed", origin);
    })
}
