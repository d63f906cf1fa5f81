//! Remote command execution over a multiplexed channel connection.

use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use kubus_core::{Channel, ClientError, ClientResult, ExecFrame, ExecStatus, Query};
use kubus_kubehub::{ConnectionEvent, FrameSink, Transport};
use metrics::counter;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::terminal::{CrosstermTerminal, RawModeGuard, Terminal};
use crate::CancelHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub container: Option<String>,
    /// Program and arguments; each element becomes one `command` parameter.
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { container: None, command: Vec::new(), stdin: true, stdout: true, stderr: false, tty: true }
    }
}

impl ExecOptions {
    pub fn command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { command: command.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn stdin(mut self, on: bool) -> Self { self.stdin = on; self }
    pub fn stdout(mut self, on: bool) -> Self { self.stdout = on; self }
    pub fn stderr(mut self, on: bool) -> Self { self.stderr = on; self }
    pub fn tty(mut self, on: bool) -> Self { self.tty = on; self }

    /// Handshake query. `stderr` is only sent when requested.
    pub fn query(&self) -> Query {
        let mut q = Query::new();
        for part in &self.command {
            q.push("command", part);
        }
        q.push_opt("container", self.container.as_deref());
        q.push("stdin", self.stdin);
        q.push("stdout", self.stdout);
        if self.stderr { q.push("stderr", true); }
        q.push("tty", self.tty);
        q
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Init,
    Handshake,
    Open,
    Closing,
    Closed,
}

/// Output frame as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecChunk {
    pub channel: Channel,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    /// Delivered to the consumer as it arrived.
    Streamed,
    /// Written to the local display.
    Displayed,
    Collected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Status(ExecStatus),
    TransportError(String),
    ClosedWithoutStatus,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub outcome: SessionOutcome,
    pub output: ExecOutput,
}

impl ExecReport {
    pub fn exit_code(&self) -> Option<i32> {
        match &self.outcome {
            SessionOutcome::Status(s) => s.exit_code,
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(&self.outcome, SessionOutcome::Status(s) if s.success)
    }
}

type Consumer = Box<dyn FnMut(ExecChunk) -> anyhow::Result<()> + Send>;
type Display = Box<dyn Write + Send>;

enum Output {
    Consumer(Consumer),
    Display { out: Display, err: Display },
    Collect(Vec<u8>),
}

impl Output {
    fn deliver(&mut self, chunk: ExecChunk) -> ClientResult<()> {
        match self {
            Output::Consumer(f) => f(chunk).map_err(ClientError::Callback),
            Output::Display { out, err } => {
                let w = if chunk.channel == Channel::Stderr { err } else { out };
                if let Err(e) = w.write_all(&chunk.data).and_then(|_| w.flush()) {
                    debug!(error = %e, "exec: display write failed");
                }
                Ok(())
            }
            Output::Collect(buf) => {
                buf.extend_from_slice(&chunk.data);
                Ok(())
            }
        }
    }

    fn finish(self) -> ExecOutput {
        match self {
            Output::Consumer(_) => ExecOutput::Streamed,
            Output::Display { .. } => ExecOutput::Displayed,
            Output::Collect(buf) => ExecOutput::Collected(String::from_utf8_lossy(&buf).into_owned()),
        }
    }
}

/// One exec session against a pod's `exec` subresource.
///
/// Output goes to the consumer when one is set, else to the local display
/// when `tty` is on, else it is collected and returned. With `stdin` and
/// `tty` both on, the local terminal is switched to raw mode for the session
/// and restored on every exit path.
pub struct ExecSession {
    transport: Arc<dyn Transport>,
    path: String,
    opts: ExecOptions,
    terminal: Arc<dyn Terminal>,
    input: Option<mpsc::Receiver<Bytes>>,
    display: Option<(Display, Display)>,
    consumer: Option<Consumer>,
    cancel: Option<oneshot::Receiver<()>>,
    window_changes: bool,
    state: ExecState,
}

impl ExecSession {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>, opts: ExecOptions) -> Self {
        Self {
            transport,
            path: path.into(),
            opts,
            terminal: Arc::new(CrosstermTerminal),
            input: None,
            display: None,
            consumer: None,
            cancel: None,
            window_changes: true,
            state: ExecState::Init,
        }
    }

    pub fn with_terminal(mut self, terminal: Arc<dyn Terminal>) -> Self {
        self.terminal = terminal;
        self
    }

    /// Replaces process stdin as the input source. Each received buffer is sent as one frame.
    pub fn with_input(mut self, input: mpsc::Receiver<Bytes>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_display(mut self, out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        let out: Display = Box::new(out);
        let err: Display = Box::new(err);
        self.display = Some((out, err));
        self
    }

    pub fn with_consumer<F>(mut self, consumer: F) -> Self
    where
        F: FnMut(ExecChunk) -> anyhow::Result<()> + Send + 'static,
    {
        let consumer: Consumer = Box::new(consumer);
        self.consumer = Some(consumer);
        self
    }

    /// Stop sending resize frames on window-change signals.
    pub fn without_window_changes(mut self) -> Self {
        self.window_changes = false;
        self
    }

    pub fn cancel_handle(&mut self) -> CancelHandle {
        let (tx, rx) = oneshot::channel();
        self.cancel = Some(rx);
        CancelHandle::new(tx)
    }

    pub fn state(&self) -> ExecState { self.state }

    fn enter(&mut self, next: ExecState) {
        debug!(path = %self.path, from = ?self.state, to = ?next, "exec: state");
        self.state = next;
    }

    /// Runs the session to completion. Handshake failures are returned as `Err`;
    /// once open, the way the session ended is the report's `outcome`. A
    /// consumer failure or a malformed frame is returned as `Err` after cleanup.
    pub async fn run(&mut self) -> ClientResult<ExecReport> {
        if self.state != ExecState::Init {
            return Err(ClientError::Configuration("exec session already ran".into()));
        }
        let t0 = Instant::now();
        let query = self.opts.query();
        self.enter(ExecState::Handshake);
        info!(path = %self.path, query = %query.encode(), "exec: connecting");
        let conn = match self.transport.connect(&self.path, &query).await {
            Ok(c) => c,
            Err(e) => {
                self.enter(ExecState::Closed);
                return Err(e);
            }
        };
        counter!("kubus_exec_sessions_total", 1u64);
        self.enter(ExecState::Open);
        let mut events = conn.events;
        let mut sink = conn.sink;

        let interactive = self.opts.stdin && self.opts.tty;
        let guard = if interactive {
            match RawModeGuard::acquire(self.terminal.clone()).await {
                Ok(g) => Some(g),
                Err(e) => {
                    warn!(error = %e, "exec: could not switch terminal to raw mode");
                    None
                }
            }
        } else {
            None
        };

        let mut output = match (self.consumer.take(), self.display.take()) {
            (Some(f), _) => Output::Consumer(f),
            (None, display) if self.opts.tty => {
                let (out, err) = display.unwrap_or_else(|| -> (Display, Display) { (Box::new(std::io::stdout()), Box::new(std::io::stderr())) });
                Output::Display { out, err }
            }
            (None, _) => Output::Collect(Vec::new()),
        };
        let mut input = match (self.opts.stdin, self.input.take()) {
            (false, _) => None,
            (true, Some(rx)) => Some(Input::Owned(rx)),
            (true, None) => Some(Input::Shared(local_stdin().lock_owned().await)),
        };
        let mut cancel = self.cancel.take();
        let mut winch = WindowChanges::new(self.opts.tty && self.window_changes);

        let result = self.pump(&mut events, sink.as_mut(), &mut output, &mut input, &mut cancel, &mut winch).await;

        self.enter(ExecState::Closing);
        if let Err(e) = sink.close().await {
            debug!(error = %e, "exec: close failed");
        }
        drop(events);
        drop(guard);
        self.enter(ExecState::Closed);

        let outcome = result?;
        info!(path = %self.path, outcome = ?outcome, took_ms = %t0.elapsed().as_millis(), "exec: session ended");
        Ok(ExecReport { outcome, output: output.finish() })
    }

    async fn pump(
        &mut self,
        events: &mut futures::stream::BoxStream<'static, ConnectionEvent>,
        sink: &mut dyn FrameSink,
        output: &mut Output,
        input: &mut Option<Input>,
        cancel: &mut Option<oneshot::Receiver<()>>,
        winch: &mut WindowChanges,
    ) -> ClientResult<SessionOutcome> {
        if self.opts.tty {
            if let Some((w, h)) = self.terminal.size() {
                if let Err(e) = sink.send(ExecFrame::resize(w, h).encode()).await {
                    return Ok(SessionOutcome::TransportError(e.to_string()));
                }
            }
        }
        loop {
            tokio::select! {
                _ = cancelled(cancel) => {
                    info!(path = %self.path, "exec: cancelled");
                    return Ok(SessionOutcome::Cancelled);
                }
                ev = events.next() => match ev {
                    None | Some(ConnectionEvent::Closed) => return Ok(SessionOutcome::ClosedWithoutStatus),
                    Some(ConnectionEvent::Connected) => debug!(path = %self.path, "exec: connected"),
                    Some(ConnectionEvent::Error(msg)) => {
                        warn!(path = %self.path, error = %msg, "exec: transport error");
                        return Ok(SessionOutcome::TransportError(msg));
                    }
                    Some(ConnectionEvent::Data(raw)) => {
                        let Some(frame) = ExecFrame::decode(raw)? else { continue };
                        match frame.channel {
                            Channel::Stdout | Channel::Stderr if frame.payload.is_empty() => {}
                            Channel::Stdout | Channel::Stderr => {
                                output.deliver(ExecChunk { channel: frame.channel, data: frame.payload })?;
                            }
                            Channel::Status => {
                                let status = ExecStatus::from_payload(&frame.payload)?;
                                self.enter(ExecState::Closing);
                                return Ok(SessionOutcome::Status(status));
                            }
                            Channel::Stdin | Channel::Resize => {
                                debug!(channel = ?frame.channel, "exec: ignoring frame on outbound channel");
                            }
                        }
                    }
                },
                chunk = next_input(input) => match chunk {
                    Some(data) if !data.is_empty() => {
                        if let Err(e) = sink.send(ExecFrame::stdin(data).encode()).await {
                            return Ok(SessionOutcome::TransportError(e.to_string()));
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!(path = %self.path, "exec: local input closed");
                        *input = None;
                    }
                },
                _ = winch.changed() => {
                    if let Some((w, h)) = self.terminal.size() {
                        if let Err(e) = sink.send(ExecFrame::resize(w, h).encode()).await {
                            return Ok(SessionOutcome::TransportError(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

async fn cancelled(cancel: &mut Option<oneshot::Receiver<()>>) {
    match cancel {
        Some(rx) => {
            if rx.await.is_ok() { return; }
            // handle dropped without cancelling
            *cancel = None;
            std::future::pending::<()>().await
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_input(input: &mut Option<Input>) -> Option<Bytes> {
    match input {
        Some(Input::Owned(rx)) => rx.recv().await,
        Some(Input::Shared(rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Input {
    Owned(mpsc::Receiver<Bytes>),
    /// Process stdin, held for the session so concurrent sessions take turns.
    Shared(OwnedMutexGuard<mpsc::Receiver<Bytes>>),
}

/// Process stdin, read by one background thread for the life of the process.
/// A blocking read cannot be abandoned, so the reader is spawned once and
/// shared; bytes typed between sessions are delivered to the next session.
fn local_stdin() -> Arc<AsyncMutex<mpsc::Receiver<Bytes>>> {
    static STDIN: OnceLock<Arc<AsyncMutex<mpsc::Receiver<Bytes>>>> = OnceLock::new();
    STDIN.get_or_init(|| Arc::new(AsyncMutex::new(spawn_stdin_reader()))).clone()
}

fn spawn_stdin_reader() -> mpsc::Receiver<Bytes> {
    use std::io::Read;
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() { break; }
                }
            }
        }
    });
    rx
}

struct WindowChanges {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl WindowChanges {
    fn new(enabled: bool) -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = if enabled { signal(SignalKind::window_change()).ok() } else { None };
            Self { signal }
        }
        #[cfg(not(unix))]
        {
            let _ = enabled;
            Self {}
        }
    }

    async fn changed(&mut self) {
        #[cfg(unix)]
        if let Some(sig) = self.signal.as_mut() {
            if sig.recv().await.is_some() { return; }
            self.signal = None;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{MemoryTerminal, TerminalMode};
    use kubus_kubehub::mock::{MockConnection, MockTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    const PATH: &str = "/api/v1/namespaces/test-namespace/pods/test-pod/exec";
    const SUCCESS: &[u8] = br#"{"metadata":{},"status":"Success"}"#;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }

    impl SharedBuf {
        fn text(&self) -> String { String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned() }
    }

    fn shell() -> ExecOptions { ExecOptions::command(["/bin/bash"]).container("test-container") }

    async fn wait_for_frames(conn: &MockConnection, n: usize) {
        for _ in 0..200 {
            if conn.sent().len() >= n { return; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} frames, got {:?}", conn.sent());
    }

    #[test]
    fn query_shapes() {
        assert_eq!(shell().query().encode(), "command=%2Fbin%2Fbash&container=test-container&stdin=true&stdout=true&tty=true");
        let ls = ExecOptions::command(["ls", "-la"]).container("test-container");
        assert_eq!(ls.query().encode(), "command=ls&command=-la&container=test-container&stdin=true&stdout=true&tty=true");
        let quiet = ExecOptions::command(["date"]).stdin(false).tty(false).stderr(true);
        assert_eq!(quiet.query().encode(), "command=date&stdin=false&stdout=true&stderr=true&tty=false");
    }

    #[tokio::test]
    async fn stdin_input_becomes_one_channel_zero_frame() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        let term = Arc::new(MemoryTerminal::new());
        let (tx, rx) = mpsc::channel(4);
        let display = SharedBuf::default();
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(term.clone())
            .with_input(rx)
            .with_display(display.clone(), display.clone())
            .without_window_changes();
        let task = tokio::spawn(async move {
            let report = session.run().await;
            (session.state(), report)
        });

        conn.emit(ConnectionEvent::Connected).emit_frame(1, b"");
        tx.send(Bytes::from_static(b"ls\n")).await.expect("send");
        wait_for_frames(&conn, 1).await;
        assert!(term.is_raw());
        conn.emit_frame(1, b"file1\n").emit_frame(3, SUCCESS);

        let (state, report) = task.await.expect("join");
        let report = report.expect("report");
        assert_eq!(state, ExecState::Closed);
        assert_eq!(conn.sent(), vec![Bytes::from_static(&[0, 108, 115, 10])]);
        assert!(report.success());
        assert_eq!(report.exit_code(), Some(0));
        assert_eq!(report.output, ExecOutput::Displayed);
        assert_eq!(display.text(), "file1\n");
        assert!(conn.is_closed());
        assert!(!term.is_raw());
        let (path, query) = mock.connects().remove(0);
        assert_eq!(path, PATH);
        assert_eq!(query.encode(), "command=%2Fbin%2Fbash&container=test-container&stdin=true&stdout=true&tty=true");
    }

    #[tokio::test]
    async fn collects_output_without_tty_and_reports_exit_code() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        conn.emit_frame(1, b"hello ")
            .emit_frame(2, b"warn ")
            .emit_frame(1, b"world")
            .emit_frame(3, br#"{"metadata":{},"status":"Failure","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"2"}]}}"#);
        let term = Arc::new(MemoryTerminal::new());
        let opts = ExecOptions::command(["sh", "-c", "echo"]).stdin(false).tty(false);
        let mut session = ExecSession::new(mock.clone(), PATH, opts).with_terminal(term.clone());
        let report = session.run().await.expect("report");
        assert_eq!(report.output, ExecOutput::Collected("hello warn world".into()));
        assert_eq!(report.exit_code(), Some(2));
        assert!(!report.success());
        assert!(term.changes().is_empty());
    }

    #[tokio::test]
    async fn consumer_takes_precedence_over_tty() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        conn.emit_frame(1, b"a").emit_frame(2, b"b").emit_frame(3, SUCCESS);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let display = SharedBuf::default();
        let (_tx, rx) = mpsc::channel(1);
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(Arc::new(MemoryTerminal::new()))
            .with_input(rx)
            .with_display(display.clone(), display.clone())
            .without_window_changes()
            .with_consumer(move |c| {
                sink.lock().expect("lock").push((c.channel, c.data));
                Ok(())
            });
        let report = session.run().await.expect("report");
        assert_eq!(report.output, ExecOutput::Streamed);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![(Channel::Stdout, Bytes::from_static(b"a")), (Channel::Stderr, Bytes::from_static(b"b"))]
        );
        assert_eq!(display.text(), "");
    }

    #[tokio::test]
    async fn terminal_restored_after_transport_error() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        conn.emit(ConnectionEvent::Error("connection reset".into()));
        let term = Arc::new(MemoryTerminal::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(term.clone())
            .with_input(rx)
            .with_display(SharedBuf::default(), SharedBuf::default())
            .without_window_changes();
        let report = session.run().await.expect("report");
        assert_eq!(report.outcome, SessionOutcome::TransportError("connection reset".into()));
        assert_eq!(term.changes(), vec![TerminalMode { raw: true }, TerminalMode { raw: false }]);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn terminal_restored_after_consumer_error() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        conn.emit_frame(1, b"boom");
        let term = Arc::new(MemoryTerminal::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(term.clone())
            .with_input(rx)
            .without_window_changes()
            .with_consumer(|_| anyhow::bail!("consumer gave up"));
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ClientError::Callback(_)));
        assert_eq!(session.state(), ExecState::Closed);
        assert!(!term.is_raw());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn hang_up_without_status_and_resize_frame() {
        let mock = Arc::new(MockTransport::new());
        let mut conn = mock.push_connection();
        conn.emit_frame(1, b"partial");
        conn.hang_up();
        let term = Arc::new(MemoryTerminal::new().with_size(120, 40));
        let (_tx, rx) = mpsc::channel(1);
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(term.clone())
            .with_input(rx)
            .with_display(SharedBuf::default(), SharedBuf::default())
            .without_window_changes();
        let report = session.run().await.expect("report");
        assert_eq!(report.outcome, SessionOutcome::ClosedWithoutStatus);
        assert_eq!(conn.sent(), vec![ExecFrame::resize(120, 40).encode()]);
        assert!(!term.is_raw());
    }

    #[tokio::test]
    async fn unknown_channel_is_protocol_error() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        conn.emit_frame(9, b"?");
        let mut session = ExecSession::new(mock.clone(), PATH, ExecOptions::command(["true"]).stdin(false).tty(false));
        assert!(matches!(session.run().await, Err(ClientError::Protocol(_))));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn cancel_ends_session_and_restores_terminal() {
        let mock = Arc::new(MockTransport::new());
        let conn = mock.push_connection();
        let term = Arc::new(MemoryTerminal::new());
        let (_tx, rx) = mpsc::channel(1);
        let mut session = ExecSession::new(mock.clone(), PATH, shell())
            .with_terminal(term.clone())
            .with_input(rx)
            .with_display(SharedBuf::default(), SharedBuf::default())
            .without_window_changes();
        let cancel = session.cancel_handle();
        let task = tokio::spawn(async move { session.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), task).await.expect("finished").expect("join").expect("report");
        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        assert!(!term.is_raw());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn shared_input_passes_between_sessions() {
        assert!(Arc::ptr_eq(&local_stdin(), &local_stdin()));

        let (tx, rx) = mpsc::channel(4);
        let shared = Arc::new(AsyncMutex::new(rx));
        let mut first = Some(Input::Shared(shared.clone().lock_owned().await));
        tx.send(Bytes::from_static(b"a")).await.expect("send");
        assert_eq!(next_input(&mut first).await, Some(Bytes::from_static(b"a")));

        let waiting = tokio::spawn({
            let shared = shared.clone();
            async move { Some(Input::Shared(shared.lock_owned().await)) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        tx.send(Bytes::from_static(b"typed between sessions")).await.expect("send");
        drop(first);
        let mut second = waiting.await.expect("join");
        assert_eq!(next_input(&mut second).await, Some(Bytes::from_static(b"typed between sessions")));
    }

    #[tokio::test]
    async fn handshake_failure_is_synchronous() {
        let mock = Arc::new(MockTransport::new());
        mock.push_connect_error(ClientError::from_status(403, br#"{"message":"pods \"p\" is forbidden"}"#));
        let term = Arc::new(MemoryTerminal::new());
        let mut session = ExecSession::new(mock.clone(), PATH, shell()).with_terminal(term.clone());
        assert!(matches!(session.run().await, Err(ClientError::Rejected { code: 403, .. })));
        assert_eq!(session.state(), ExecState::Closed);
        assert!(term.changes().is_empty());
    }
}
