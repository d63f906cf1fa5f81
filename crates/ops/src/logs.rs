use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use kubus_core::{ClientError, ClientResult, Query};
use kubus_kubehub::{ApiRequest, ByteStream, Transport};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::{CancelHandle, StreamHandle};

/// A fragment of log output exactly as received; not line aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Bytes,
}

impl LogChunk {
    pub fn text(&self) -> Cow<'_, str> { String::from_utf8_lossy(&self.data) }
}

/// Options for the `log` subresource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    pub container: Option<String>,
    /// Keep the stream open for new output.
    pub follow: bool,
    pub timestamps: bool,
    pub tail_lines: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
}

impl LogOptions {
    pub fn query(&self) -> Query {
        let mut q = Query::new();
        q.push_opt("container", self.container.as_deref());
        q.push("timestamps", self.timestamps);
        q.push_opt("tailLines", self.tail_lines);
        q.push_opt("sinceTime", self.since_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)));
        q.push("follow", self.follow);
        q
    }
}

/// Reads the whole log in one bounded request.
pub async fn logs(transport: &dyn Transport, path: &str, opts: &LogOptions) -> ClientResult<String> {
    if opts.follow {
        warn!(path = %path, "logs: following without a consumer does not stream; reading until the server closes");
    }
    let t0 = Instant::now();
    let cfg = transport.config();
    let timeout = if opts.follow { cfg.log_follow_timeout } else { cfg.request_timeout };
    let req = ApiRequest::get(path).with_query(opts.query()).with_read_timeout(Some(timeout));
    let body = transport.request(req).await?;
    info!(path = %path, bytes = body.len(), took_ms = %t0.elapsed().as_millis(), "logs: read");
    Ok(String::from_utf8_lossy(&body).into_owned())
}

async fn open(transport: &dyn Transport, path: &str, opts: &LogOptions) -> ClientResult<ByteStream> {
    let cfg = transport.config();
    let timeout = if opts.follow { cfg.log_follow_timeout } else { cfg.request_timeout };
    info!(path = %path, container = ?opts.container, follow = opts.follow, tail = ?opts.tail_lines, "logs: stream starting");
    let req = ApiRequest::get(path).with_query(opts.query()).with_read_timeout(Some(timeout));
    transport.request_stream(req).await
}

/// Streams the log to `consumer` chunk by chunk, in arrival order. Empty
/// chunks are skipped. A consumer error ends the stream and is returned as
/// `ClientError::Callback`.
pub async fn logs_to<F>(transport: &dyn Transport, path: &str, opts: &LogOptions, mut consumer: F) -> ClientResult<()>
where
    F: FnMut(LogChunk) -> anyhow::Result<()>,
{
    let mut stream = open(transport, path, opts).await?;
    let mut chunks = 0u64;
    while let Some(next) = stream.next().await {
        let data = next?;
        if data.is_empty() { continue; }
        chunks += 1;
        counter!("kubus_log_chunks_total", 1u64);
        consumer(LogChunk { data }).map_err(ClientError::Callback)?;
    }
    info!(path = %path, chunks, "logs: stream ended");
    Ok(())
}

/// Streams the log on a background task into a bounded channel. A read
/// failure is sent as the last item before the channel closes.
pub async fn spawn_logs(
    transport: Arc<dyn Transport>,
    path: String,
    opts: LogOptions,
) -> ClientResult<StreamHandle<ClientResult<LogChunk>>> {
    let stream = open(transport.as_ref(), &path, &opts).await?;
    let (tx, rx) = mpsc::channel::<ClientResult<LogChunk>>(transport.config().queue_cap.max(1));
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(pump_chunks(stream, tx, cancel_rx, path));
    Ok(StreamHandle { rx, cancel: CancelHandle::new(cancel_tx) })
}

async fn pump_chunks(stream: ByteStream, tx: mpsc::Sender<ClientResult<LogChunk>>, mut cancel_rx: oneshot::Receiver<()>, ctx: String) {
    let mut stream = stream.fuse();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => { info!(ctx = %ctx, "logs: pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(data)) => {
                        if data.is_empty() { continue; }
                        counter!("kubus_log_chunks_total", 1u64);
                        if tx.send(Ok(LogChunk { data })).await.is_err() { break; }
                    }
                    Some(Err(e)) => {
                        warn!(ctx = %ctx, error = %e, "logs: stream error");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    info!(ctx = %ctx, "logs: pump ended");
}
