//! Kubus Ops: pod log streaming and interactive exec sessions.
//!
//! Both operate on a fully-resolved subresource path (`.../pods/<name>/log`
//! or `.../pods/<name>/exec`) over a shared `Transport`.

#![forbid(unsafe_code)]

mod exec;
mod logs;
pub mod terminal;

use tokio::sync::{mpsc, oneshot};

pub use exec::{ExecChunk, ExecOptions, ExecOutput, ExecReport, ExecSession, ExecState, SessionOutcome};
pub use logs::{logs, logs_to, spawn_logs, LogChunk, LogOptions};
pub use terminal::{CrosstermTerminal, MemoryTerminal, RawModeGuard, Terminal, TerminalMode};

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> Self { Self { tx: Some(tx) } }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}
