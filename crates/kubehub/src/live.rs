use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use kube::Client;
use kubus_core::{ClientError, ClientResult, Query};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::{ApiRequest, ByteStream, ClientConfig, Connection, ConnectionEvent, FrameSink, Transport};

/// Transport over `kube::Client`; credentials and cluster endpoint come from
/// kubeconfig or the in-cluster environment.
pub struct KubeTransport {
    client: Client,
    config: ClientConfig,
    delete_body: OnceCell<bool>,
}

impl KubeTransport {
    pub fn new(client: Client, config: ClientConfig) -> Self {
        Self { client, config, delete_body: OnceCell::new() }
    }

    pub async fn try_default() -> ClientResult<Self> {
        let client = Client::try_default().await.map_err(|e| ClientError::Configuration(e.to_string()))?;
        Ok(Self::new(client, ClientConfig::from_env()))
    }

    pub fn client(&self) -> &Client { &self.client }

    async fn probe_delete_body(&self) -> ClientResult<bool> {
        if let Some(forced) = self.config.delete_body {
            return Ok(forced);
        }
        let info = self.client.apiserver_version().await.map_err(map_kube_err)?;
        let need = delete_body_required(&info.major, &info.minor);
        info!(major = %info.major, minor = %info.minor, need_delete_body = need, "kube: server version probed");
        Ok(need)
    }
}

/// Servers before 1.11 reject DELETE requests without a body.
fn delete_body_required(major: &str, minor: &str) -> bool {
    let num = |s: &str| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<u32>().ok();
    match (num(major), num(minor)) {
        (Some(1), Some(m)) => m < 11,
        (Some(0), _) => true,
        _ => false,
    }
}

fn build(req: &ApiRequest) -> ClientResult<http::Request<Vec<u8>>> {
    let mut b = http::Request::builder().method(req.method.as_str()).uri(req.uri());
    for (k, v) in &req.headers {
        b = b.header(k.as_str(), v.as_str());
    }
    b.body(req.body.clone().unwrap_or_default()).map_err(|e| ClientError::Configuration(e.to_string()))
}

fn map_kube_err(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => ClientError::from_status(ae.code, ae.message.as_bytes()),
        other => ClientError::Connection(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn request(&self, req: ApiRequest) -> ClientResult<Bytes> {
        let timeout = req.read_timeout.unwrap_or(self.config.request_timeout);
        let http_req = build(&req)?;
        let t0 = Instant::now();
        let text = tokio::time::timeout(timeout, self.client.request_text(http_req))
            .await
            .map_err(|_| ClientError::Connection(format!("{} {} timed out after {}s", req.method.as_str(), req.path, timeout.as_secs())))?
            .map_err(map_kube_err)?;
        debug!(method = req.method.as_str(), path = %req.path, bytes = text.len(), took_ms = %t0.elapsed().as_millis(), "kube: request done");
        Ok(Bytes::from(text))
    }

    async fn request_stream(&self, req: ApiRequest) -> ClientResult<ByteStream> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let http_req = build(&req)?;
        let client = self.client.clone();
        let idle = req.read_timeout;
        let path = req.path.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<ClientResult<()>>();
        let (tx, rx) = mpsc::channel::<ClientResult<Bytes>>(64);

        tokio::spawn(async move {
            let reader = match client.request_stream(http_req).await {
                Ok(r) => {
                    let _ = ready_tx.send(Ok(()));
                    r
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(map_kube_err(e)));
                    return;
                }
            };
            let stream = ReaderStream::new(reader.compat());
            futures::pin_mut!(stream);
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => { debug!(path = %path, "kube: stream receiver dropped"); break; }
                    next = next_within(&mut stream, idle) => next,
                };
                match next {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk)).await.is_err() { break; }
                    }
                    Ok(Some(Err(e))) => {
                        warn!(path = %path, error = %e, "kube: stream read failed");
                        let _ = tx.send(Err(ClientError::Connection(e.to_string()))).await;
                        break;
                    }
                    Ok(None) => break,
                    Err(d) => {
                        let _ = tx.send(Err(ClientError::Connection(format!("no data received for {}s", d.as_secs())))).await;
                        break;
                    }
                }
            }
            debug!(path = %path, "kube: stream ended");
        });

        ready_rx.await.map_err(|_| ClientError::Connection("stream task ended before the response arrived".into()))??;
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn connect(&self, path: &str, query: &Query) -> ClientResult<Connection> {
        let req = build(&ApiRequest::get(path).with_query(query.clone()))?;
        let ws = self.client.connect(req).await.map_err(map_kube_err)?;
        info!(path = %path, "kube: channel connection upgraded");
        let (sink, stream) = ws.split();
        let inbound = stream.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Binary(b)) => Some(ConnectionEvent::Data(b)),
                Ok(Message::Text(t)) => Some(ConnectionEvent::Data(Bytes::copy_from_slice(t.as_str().as_bytes()))),
                Ok(Message::Close(_)) => Some(ConnectionEvent::Closed),
                Ok(_) => None,
                Err(e) => Some(ConnectionEvent::Error(e.to_string())),
            })
        });
        let events = futures::stream::once(async { ConnectionEvent::Connected })
            .chain(inbound)
            .chain(futures::stream::once(async { ConnectionEvent::Closed }))
            .boxed();
        Ok(Connection { events, sink: Box::new(WsSink { inner: sink }) })
    }

    async fn need_delete_body(&self) -> ClientResult<bool> {
        self.delete_body.get_or_try_init(|| self.probe_delete_body()).await.copied()
    }

    fn config(&self) -> &ClientConfig { &self.config }
}

async fn next_within<S>(stream: &mut S, idle: Option<Duration>) -> Result<Option<S::Item>, Duration>
where
    S: futures::Stream + Unpin,
{
    match idle {
        Some(d) => tokio::time::timeout(d, stream.next()).await.map_err(|_| d),
        None => Ok(stream.next().await),
    }
}

struct WsSink<S> {
    inner: S,
}

#[async_trait::async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Send + Unpin,
{
    async fn send(&mut self, frame: Bytes) -> ClientResult<()> {
        self.inner.send(Message::binary(frame)).await.map_err(|e| ClientError::Connection(e.to_string()))
    }

    async fn close(&mut self) -> ClientResult<()> {
        match self.inner.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ClientError::Connection(e.to_string())),
        }
    }
}
