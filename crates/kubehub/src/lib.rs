//! Kubus kubehub: the transport seam between typed operations and the cluster.
//!
//! `Transport` covers the three shapes of traffic the client needs (buffered
//! request/response, a streamed response body, and a bidirectional framed
//! connection). `KubeTransport` implements it over `kube::Client`;
//! `mock::MockTransport` is a scripted in-memory implementation for tests.

#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use kubus_core::{ClientResult, Query};

mod live;
pub mod mock;

pub use live::KubeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// One HTTP exchange against the API server. `path` is server-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Query,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Idle read timeout. `None` on a streamed request means wait indefinitely;
    /// on a buffered request the transport's configured default applies.
    pub read_timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Query::new(), headers: Vec::new(), body: None, read_timeout: None }
    }

    pub fn get(path: impl Into<String>) -> Self { Self::new(Method::Get, path) }
    pub fn post(path: impl Into<String>) -> Self { Self::new(Method::Post, path) }
    pub fn put(path: impl Into<String>) -> Self { Self::new(Method::Put, path) }
    pub fn patch(path: impl Into<String>) -> Self { Self::new(Method::Patch, path) }
    pub fn delete(path: impl Into<String>) -> Self { Self::new(Method::Delete, path) }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets the body together with its `Content-Type`.
    pub fn with_body(self, body: Vec<u8>, content_type: &str) -> Self {
        let mut me = self.with_header("Content-Type", content_type);
        me.body = Some(body);
        me
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// `path?query` as sent on the wire.
    pub fn uri(&self) -> String { self.query.with_path(&self.path) }
}

pub type ByteStream = BoxStream<'static, ClientResult<Bytes>>;

/// Inbound side of a framed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Data(Bytes),
    Error(String),
    Closed,
}

/// Outbound side of a framed connection.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> ClientResult<()>;
    async fn close(&mut self) -> ClientResult<()>;
}

pub struct Connection {
    pub events: BoxStream<'static, ConnectionEvent>,
    pub sink: Box<dyn FrameSink>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Buffered request; non-2xx responses are classified into `ClientError`.
    async fn request(&self, req: ApiRequest) -> ClientResult<Bytes>;

    /// Streamed response body, chunks in arrival order. Establishment failures
    /// (including non-2xx) are returned synchronously.
    async fn request_stream(&self, req: ApiRequest) -> ClientResult<ByteStream>;

    /// Opens a framed bidirectional connection (channel protocol upgrade).
    async fn connect(&self, path: &str, query: &Query) -> ClientResult<Connection>;

    /// Whether DELETE requests may carry a `DeleteOptions` body. Probed once.
    async fn need_delete_body(&self) -> ClientResult<bool>;

    fn config(&self) -> &ClientConfig;
}

/// Runtime knobs, read from the environment by `from_env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub log_follow_timeout: Duration,
    pub queue_cap: usize,
    /// Forces the delete-body capability instead of probing the server.
    pub delete_body: Option<bool>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            log_follow_timeout: Duration::from_secs(3600),
            queue_cap: 1024,
            delete_body: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key).and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
        };
        let request_timeout = secs("KUBUS_REQUEST_TIMEOUT_SECS", d.request_timeout);
        let log_follow_timeout = secs("KUBUS_LOG_FOLLOW_TIMEOUT_SECS", d.log_follow_timeout);
        let queue_cap = lookup("KUBUS_QUEUE_CAP").and_then(|s| s.trim().parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(d.queue_cap);
        let delete_body = lookup("KUBUS_DELETE_BODY").and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        });
        Self { request_timeout, log_follow_timeout, queue_cap, delete_body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults_when_unset() {
        let cfg = ClientConfig::from_lookup(|_| None);
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.log_follow_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("KUBUS_REQUEST_TIMEOUT_SECS", "5"),
            ("KUBUS_LOG_FOLLOW_TIMEOUT_SECS", "soon"),
            ("KUBUS_QUEUE_CAP", "0"),
            ("KUBUS_DELETE_BODY", "False"),
        ]
        .into_iter()
        .collect();
        let cfg = ClientConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.log_follow_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.queue_cap, 1024);
        assert_eq!(cfg.delete_body, Some(false));
    }

    #[test]
    fn request_builder_sets_content_type_and_uri() {
        let mut q = Query::new();
        q.push("labelSelector", "app=test");
        let req = ApiRequest::patch("/api/v1/nodes/n1").with_query(q).with_body(b"{}".to_vec(), "application/merge-patch+json");
        assert_eq!(req.method.as_str(), "PATCH");
        assert_eq!(req.header("content-type"), Some("application/merge-patch+json"));
        assert_eq!(req.uri(), "/api/v1/nodes/n1?labelSelector=app%3Dtest");
    }
}
