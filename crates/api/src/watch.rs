//! Watch streams: a streamed GET with `watch=1` whose body is a sequence of
//! `{type, object}` JSON documents, split at arbitrary byte boundaries.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use kubus_core::{ClientError, ClientResult, EventType, Query, WatchEvent};
use kubus_kubehub::{ApiRequest, ByteStream, Transport};
use metrics::counter;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Start after this version; also what a caller resumes from.
    pub resource_version: Option<String>,
    /// Server closes the stream after this many seconds.
    pub timeout_seconds: Option<u32>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl WatchOptions {
    fn query(&self) -> Query {
        let mut q = Query::new();
        q.push("watch", 1);
        q.push_opt("resourceVersion", self.resource_version.as_deref());
        q.push_opt("timeoutSeconds", self.timeout_seconds);
        q.push_opt("labelSelector", self.label_selector.as_deref());
        q.push_opt("fieldSelector", self.field_selector.as_deref());
        q
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Init,
    Connecting,
    Streaming,
    Closed,
    Error,
}

/// Incremental decoder: bytes in, whole events out.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, chunk: &[u8]) { self.buf.extend_from_slice(chunk); }

    /// Next complete event, `Ok(None)` while the buffer holds only a prefix.
    pub fn next_event(&mut self) -> ClientResult<Option<WatchEvent>> {
        let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<WatchEvent>();
        let out = match iter.next() {
            None => None,
            Some(Ok(ev)) => Some(ev),
            Some(Err(e)) if e.is_eof() => return Ok(None),
            Some(Err(e)) => return Err(ClientError::Protocol(format!("malformed watch event: {}", e))),
        };
        let used = iter.byte_offset();
        self.buf.drain(..used);
        Ok(out)
    }

    /// Called at end of stream; leftover non-whitespace is a truncated event.
    pub fn finish(&mut self) -> ClientResult<()> {
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().any(|b| !b.is_ascii_whitespace()) {
            return Err(ClientError::Protocol(format!("watch stream ended inside an event ({} bytes pending)", rest.len())));
        }
        Ok(())
    }

    pub fn clear(&mut self) { self.buf.clear(); }

    pub fn pending(&self) -> usize { self.buf.len() }
}

fn event_label(t: EventType) -> &'static str {
    match t {
        EventType::Added => "ADDED",
        EventType::Modified => "MODIFIED",
        EventType::Deleted => "DELETED",
        EventType::Error => "ERROR",
        EventType::Bookmark => "BOOKMARK",
    }
}

/// Change notifications for one collection. Yields events in server order; a
/// failure is yielded once as the final item. Server close ends the stream.
/// Dropping the stream closes the connection.
pub struct WatchStream {
    path: String,
    query: Query,
    state: WatchState,
    body: Option<ByteStream>,
    decoder: EventDecoder,
    ready: VecDeque<WatchEvent>,
    failure: Option<ClientError>,
    last_resource_version: Option<String>,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("last_resource_version", &self.last_resource_version)
            .finish_non_exhaustive()
    }
}

impl WatchStream {
    pub fn new(path: String, opts: &WatchOptions) -> Self {
        Self {
            path,
            query: opts.query(),
            state: WatchState::Init,
            body: None,
            decoder: EventDecoder::new(),
            ready: VecDeque::new(),
            failure: None,
            last_resource_version: opts.resource_version.clone(),
        }
    }

    pub async fn connect(mut self, transport: &dyn Transport) -> ClientResult<Self> {
        self.state = WatchState::Connecting;
        info!(path = %self.path, query = %self.query.encode(), "watch: connecting");
        let req = ApiRequest::get(self.path.clone()).with_query(self.query.clone()).with_read_timeout(None);
        match transport.request_stream(req).await {
            Ok(body) => {
                self.body = Some(body);
                self.state = WatchState::Streaming;
                debug!(path = %self.path, "watch: streaming");
                Ok(self)
            }
            Err(e) => {
                self.state = WatchState::Error;
                warn!(path = %self.path, error = %e, "watch: connect failed");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> WatchState { self.state }

    /// Latest `resourceVersion` seen, for resuming after close.
    pub fn last_resource_version(&self) -> Option<&str> { self.last_resource_version.as_deref() }

    pub fn query(&self) -> &Query { &self.query }

    /// Drops the connection and any partial data. Already decoded events are discarded too.
    pub fn close(&mut self) {
        if matches!(self.state, WatchState::Closed | WatchState::Error) { return; }
        self.body = None;
        self.decoder.clear();
        self.ready.clear();
        self.state = WatchState::Closed;
        info!(path = %self.path, "watch: closed by caller");
    }

    fn fail(&mut self, err: ClientError) {
        warn!(path = %self.path, error = %err, "watch: stream failed");
        self.body = None;
        self.decoder.clear();
        self.failure = Some(err);
        self.state = WatchState::Error;
    }

    fn drain_decoder(&mut self) {
        loop {
            match self.decoder.next_event() {
                Ok(Some(ev)) => {
                    counter!("kubus_watch_events_total", 1u64, "type" => event_label(ev.event_type));
                    if ev.event_type != EventType::Error {
                        if let Some(rv) = ev.object.resource_version() {
                            self.last_resource_version = Some(rv.to_string());
                        }
                    }
                    self.ready.push_back(ev);
                }
                Ok(None) => return,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }
}

impl Stream for WatchStream {
    type Item = ClientResult<WatchEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(ev) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if let Some(err) = this.failure.take() {
                return Poll::Ready(Some(Err(err)));
            }
            let body = match (this.state, this.body.as_mut()) {
                (WatchState::Streaming, Some(body)) => body,
                _ => return Poll::Ready(None),
            };
            match body.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.decoder.push(&chunk);
                    this.drain_decoder();
                }
                Poll::Ready(Some(Err(e))) => this.fail(e),
                Poll::Ready(None) => {
                    this.body = None;
                    match this.decoder.finish() {
                        Ok(()) => {
                            this.state = WatchState::Closed;
                            info!(path = %this.path, last_rv = ?this.last_resource_version, "watch: server closed stream");
                        }
                        Err(e) => this.fail(e),
                    }
                }
            }
        }
    }
}
