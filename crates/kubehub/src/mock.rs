//! Scripted in-memory transport. Every request is recorded; responses,
//! streamed bodies and connections are served in the order they were pushed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use kubus_core::{ClientError, ClientResult, Query};
use tokio::sync::mpsc;

use crate::{ApiRequest, ByteStream, ClientConfig, Connection, ConnectionEvent, FrameSink, Transport};

#[derive(Default)]
struct Script {
    requests: Vec<ApiRequest>,
    connects: Vec<(String, Query)>,
    responses: VecDeque<ClientResult<Bytes>>,
    streams: VecDeque<ClientResult<ByteStream>>,
    connections: VecDeque<ClientResult<Connection>>,
}

pub struct MockTransport {
    config: ClientConfig,
    delete_body: bool,
    probes: AtomicUsize,
    script: Mutex<Script>,
}

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

impl MockTransport {
    pub fn new() -> Self {
        Self { config: ClientConfig::default(), delete_body: true, probes: AtomicUsize::new(0), script: Mutex::new(Script::default()) }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Capability answered by `need_delete_body`.
    pub fn with_delete_body(mut self, supported: bool) -> Self {
        self.delete_body = supported;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> { self.script.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn push_response(&self, body: impl Into<Bytes>) -> &Self {
        self.script().responses.push_back(Ok(body.into()));
        self
    }

    pub fn push_json(&self, value: &serde_json::Value) -> &Self {
        self.push_response(value.to_string())
    }

    pub fn push_error(&self, err: ClientError) -> &Self {
        self.script().responses.push_back(Err(err));
        self
    }

    /// Streamed body delivered as exactly these chunks.
    pub fn push_stream(&self, chunks: Vec<ClientResult<Bytes>>) -> &Self {
        self.push_byte_stream(futures::stream::iter(chunks).boxed())
    }

    pub fn push_byte_stream(&self, stream: ByteStream) -> &Self {
        self.script().streams.push_back(Ok(stream));
        self
    }

    pub fn push_stream_error(&self, err: ClientError) -> &Self {
        self.script().streams.push_back(Err(err));
        self
    }

    /// Queues a connection driven by the returned handle.
    pub fn push_connection(&self) -> MockConnection {
        let (tx, rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed();
        let sink = MockSink { sent: sent.clone(), closed: closed.clone() };
        self.script().connections.push_back(Ok(Connection { events, sink: Box::new(sink) }));
        MockConnection { tx: Some(tx), sent, closed }
    }

    pub fn push_connect_error(&self, err: ClientError) -> &Self {
        self.script().connections.push_back(Err(err));
        self
    }

    /// Requests seen so far (buffered and streamed), oldest first.
    pub fn requests(&self) -> Vec<ApiRequest> { self.script().requests.clone() }

    pub fn last_request(&self) -> Option<ApiRequest> { self.script().requests.last().cloned() }

    pub fn connects(&self) -> Vec<(String, Query)> { self.script().connects.clone() }

    /// How many times the delete-body capability was asked for.
    pub fn delete_body_probes(&self) -> usize { self.probes.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: ApiRequest) -> ClientResult<Bytes> {
        let mut s = self.script();
        let label = format!("{} {}", req.method.as_str(), req.uri());
        s.requests.push(req);
        s.responses.pop_front().unwrap_or_else(|| Err(ClientError::Connection(format!("mock: no response scripted for {}", label))))
    }

    async fn request_stream(&self, req: ApiRequest) -> ClientResult<ByteStream> {
        let mut s = self.script();
        let label = format!("{} {}", req.method.as_str(), req.uri());
        s.requests.push(req);
        s.streams.pop_front().unwrap_or_else(|| Err(ClientError::Connection(format!("mock: no stream scripted for {}", label))))
    }

    async fn connect(&self, path: &str, query: &Query) -> ClientResult<Connection> {
        let mut s = self.script();
        s.connects.push((path.to_string(), query.clone()));
        s.connections.pop_front().unwrap_or_else(|| Err(ClientError::Connection(format!("mock: no connection scripted for {}", path))))
    }

    async fn need_delete_body(&self) -> ClientResult<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.delete_body)
    }

    fn config(&self) -> &ClientConfig { &self.config }
}

/// Test-side end of a scripted connection.
pub struct MockConnection {
    tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn emit(&self, ev: ConnectionEvent) -> &Self {
        if let Some(tx) = &self.tx { let _ = tx.send(ev); }
        self
    }

    /// Emits one raw channel frame.
    pub fn emit_frame(&self, channel: u8, payload: &[u8]) -> &Self {
        let mut raw = Vec::with_capacity(payload.len() + 1);
        raw.push(channel);
        raw.extend_from_slice(payload);
        self.emit(ConnectionEvent::Data(Bytes::from(raw)))
    }

    /// Ends the inbound event stream without a close event.
    pub fn hang_up(&mut self) { self.tx.take(); }

    /// Frames written by the client, in order.
    pub fn sent(&self) -> Vec<Bytes> { self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }
}

struct MockSink {
    sent: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Bytes) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("mock: send on closed connection".into()));
        }
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(frame);
        Ok(())
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_scripted_responses_in_order_and_records_requests() {
        let mock = MockTransport::new();
        mock.push_response("one").push_error(ClientError::NotFound("gone".into()));
        assert_eq!(mock.request(ApiRequest::get("/a")).await.expect("ok").as_ref(), b"one");
        assert!(mock.request(ApiRequest::get("/b")).await.unwrap_err().is_not_found());
        assert!(matches!(mock.request(ApiRequest::get("/c")).await, Err(ClientError::Connection(_))));
        let paths: Vec<_> = mock.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn connection_records_frames_and_close() {
        let mock = MockTransport::new();
        let handle = mock.push_connection();
        handle.emit(ConnectionEvent::Connected).emit_frame(1, b"hi");
        let mut conn = mock.connect("/x", &Query::new()).await.expect("connect");
        assert_eq!(conn.events.next().await, Some(ConnectionEvent::Connected));
        assert_eq!(conn.events.next().await, Some(ConnectionEvent::Data(Bytes::from_static(b"\x01hi"))));
        conn.sink.send(Bytes::from_static(b"\x00ls")).await.expect("send");
        conn.sink.close().await.expect("close");
        assert!(conn.sink.send(Bytes::from_static(b"\x00x")).await.is_err());
        assert_eq!(handle.sent(), vec![Bytes::from_static(b"\x00ls")]);
        assert!(handle.is_closed());
    }
}
