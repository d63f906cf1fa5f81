use kubus_core::ClientResult;
use kubus_ops::{ExecOptions, ExecSession, LogChunk, LogOptions, StreamHandle};

use crate::client::ResourceClient;

/// `log` and `exec` subresources. Only meaningful for a pods client.
impl ResourceClient {
    pub async fn logs(&self, name: &str, namespace: Option<&str>, opts: &LogOptions) -> ClientResult<String> {
        let path = self.path(Some(name), namespace, Some("log"))?;
        kubus_ops::logs(self.transport().as_ref(), &path, opts).await
    }

    pub async fn logs_to<F>(&self, name: &str, namespace: Option<&str>, opts: &LogOptions, consumer: F) -> ClientResult<()>
    where
        F: FnMut(LogChunk) -> anyhow::Result<()>,
    {
        let path = self.path(Some(name), namespace, Some("log"))?;
        kubus_ops::logs_to(self.transport().as_ref(), &path, opts, consumer).await
    }

    pub async fn spawn_logs(
        &self,
        name: &str,
        namespace: Option<&str>,
        opts: LogOptions,
    ) -> ClientResult<StreamHandle<ClientResult<LogChunk>>> {
        let path = self.path(Some(name), namespace, Some("log"))?;
        kubus_ops::spawn_logs(self.transport().clone(), path, opts).await
    }

    /// Prepares a session; nothing is sent until `ExecSession::run`.
    pub fn exec(&self, name: &str, namespace: Option<&str>, opts: ExecOptions) -> ClientResult<ExecSession> {
        let path = self.path(Some(name), namespace, Some("exec"))?;
        Ok(ExecSession::new(self.transport().clone(), path, opts))
    }
}
