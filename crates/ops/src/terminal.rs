//! Local terminal control for interactive sessions.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalMode {
    /// No echo, no line buffering.
    pub raw: bool,
}

pub trait Terminal: Send + Sync {
    fn mode(&self) -> io::Result<TerminalMode>;
    fn set_mode(&self, mode: TerminalMode) -> io::Result<()>;
    /// `(columns, rows)` when known.
    fn size(&self) -> Option<(u16, u16)>;
}

/// The process's controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrosstermTerminal;

impl Terminal for CrosstermTerminal {
    fn mode(&self) -> io::Result<TerminalMode> {
        Ok(TerminalMode { raw: crossterm::terminal::is_raw_mode_enabled()? })
    }

    fn set_mode(&self, mode: TerminalMode) -> io::Result<()> {
        if mode.raw { crossterm::terminal::enable_raw_mode() } else { crossterm::terminal::disable_raw_mode() }
    }

    fn size(&self) -> Option<(u16, u16)> { crossterm::terminal::size().ok() }
}

/// In-memory terminal that records every mode change.
#[derive(Debug, Default)]
pub struct MemoryTerminal {
    raw: AtomicBool,
    size: Option<(u16, u16)>,
    changes: Mutex<Vec<TerminalMode>>,
}

impl MemoryTerminal {
    pub fn new() -> Self { Self::default() }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Some((cols, rows));
        self
    }

    pub fn is_raw(&self) -> bool { self.raw.load(Ordering::SeqCst) }

    pub fn changes(&self) -> Vec<TerminalMode> { self.changes.lock().unwrap_or_else(PoisonError::into_inner).clone() }
}

impl Terminal for MemoryTerminal {
    fn mode(&self) -> io::Result<TerminalMode> { Ok(TerminalMode { raw: self.is_raw() }) }

    fn set_mode(&self, mode: TerminalMode) -> io::Result<()> {
        self.raw.store(mode.raw, Ordering::SeqCst);
        self.changes.lock().unwrap_or_else(PoisonError::into_inner).push(mode);
        Ok(())
    }

    fn size(&self) -> Option<(u16, u16)> { self.size }
}

fn terminal_lock() -> Arc<AsyncMutex<()>> {
    static LOCK: OnceLock<Arc<AsyncMutex<()>>> = OnceLock::new();
    LOCK.get_or_init(|| Arc::new(AsyncMutex::new(()))).clone()
}

/// Holds the terminal in raw mode; the original mode is restored on drop.
/// Only one guard exists per process at a time.
pub struct RawModeGuard {
    terminal: Arc<dyn Terminal>,
    original: TerminalMode,
    _lock: OwnedMutexGuard<()>,
}

impl RawModeGuard {
    pub async fn acquire(terminal: Arc<dyn Terminal>) -> io::Result<Self> {
        let lock = terminal_lock().lock_owned().await;
        let original = terminal.mode()?;
        terminal.set_mode(TerminalMode { raw: true })?;
        debug!(was_raw = original.raw, "terminal: raw mode on");
        Ok(Self { terminal, original, _lock: lock })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        match self.terminal.set_mode(self.original) {
            Ok(()) => debug!(raw = self.original.raw, "terminal: mode restored"),
            Err(e) => warn!(error = %e, "terminal: failed to restore mode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_restores_original_mode() {
        let term = Arc::new(MemoryTerminal::new());
        {
            let _g = RawModeGuard::acquire(term.clone()).await.expect("raw");
            assert!(term.is_raw());
        }
        assert!(!term.is_raw());
        assert_eq!(term.changes(), vec![TerminalMode { raw: true }, TerminalMode { raw: false }]);
    }

    #[tokio::test]
    async fn guards_are_serialized() {
        let term = Arc::new(MemoryTerminal::new());
        let first = RawModeGuard::acquire(term.clone()).await.expect("raw");
        let second = tokio::spawn({
            let term = term.clone();
            async move { RawModeGuard::acquire(term).await.map(|_| ()) }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(first);
        tokio::time::timeout(std::time::Duration::from_secs(1), second).await.expect("released").expect("join").expect("raw");
        assert!(!term.is_raw());
    }
}
