use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use kubus_core::{ClientError, ClientResult, Query, ResourceDescriptor, ResourceInstance, ResourceList};
use kubus_kubehub::{ApiRequest, Transport};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::watch::{WatchOptions, WatchStream};

const JSON: &str = "application/json";
const MERGE_PATCH: &str = "application/merge-patch+json";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const JSON_PATCH: &str = "application/json-patch+json";

/// Server-side filters for list, watch and delete-collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn labels(selector: impl Into<String>) -> Self {
        Self { label_selector: Some(selector.into()), field_selector: None }
    }

    pub fn fields(selector: impl Into<String>) -> Self {
        Self { label_selector: None, field_selector: Some(selector.into()) }
    }

    pub(crate) fn apply(&self, q: &mut Query) {
        q.push_opt("labelSelector", self.label_selector.as_deref());
        q.push_opt("fieldSelector", self.field_selector.as_deref());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

impl PropagationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PropagationPolicy::Orphan => "Orphan",
            PropagationPolicy::Background => "Background",
            PropagationPolicy::Foreground => "Foreground",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_policy: Option<PropagationPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOptionsDoc<'a> {
    kind: &'static str,
    api_version: &'static str,
    #[serde(flatten)]
    options: &'a DeleteOptions,
}

impl DeleteOptions {
    fn apply_query(&self, q: &mut Query) {
        q.push_opt("propagationPolicy", self.propagation_policy.map(PropagationPolicy::as_str));
        q.push_opt("gracePeriodSeconds", self.grace_period_seconds);
    }

    fn document(&self) -> ClientResult<Vec<u8>> {
        Ok(serde_json::to_vec(&DeleteOptionsDoc { kind: "DeleteOptions", api_version: "v1", options: self })?)
    }
}

/// Typed CRUD over one resource type. Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct ResourceClient {
    transport: Arc<dyn Transport>,
    descriptor: ResourceDescriptor,
    namespace: Option<String>,
}

impl std::fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient").field("descriptor", &self.descriptor).field("namespace", &self.namespace).finish()
    }
}

impl ResourceClient {
    pub fn new(transport: Arc<dyn Transport>, descriptor: ResourceDescriptor) -> Self {
        Self { transport, descriptor, namespace: None }
    }

    /// Namespace used whenever a call does not name one.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn descriptor(&self) -> &ResourceDescriptor { &self.descriptor }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn transport(&self) -> &Arc<dyn Transport> { &self.transport }

    fn ns<'a>(&'a self, explicit: Option<&'a str>) -> Option<&'a str> {
        explicit.or(self.namespace.as_deref())
    }

    pub fn path(&self, name: Option<&str>, namespace: Option<&str>, subresource: Option<&str>) -> ClientResult<String> {
        self.descriptor.path(name, self.ns(namespace), subresource)
    }

    /// Descriptors without a verb list are treated as permissive.
    fn ensure_verb(&self, verb: &str) -> ClientResult<()> {
        if self.descriptor.supports(verb) { return Ok(()); }
        Err(ClientError::Configuration(format!("{} does not support {:?}", self.descriptor.name, verb)))
    }

    async fn dispatch(&self, verb: &'static str, req: ApiRequest) -> ClientResult<Bytes> {
        self.ensure_verb(verb)?;
        let t0 = Instant::now();
        let uri = req.uri();
        debug!(verb, uri = %uri, kind = %self.descriptor.kind, "api: request start");
        counter!("kubus_requests_total", 1u64, "verb" => verb);
        let res = self.transport.request(req).await;
        histogram!("kubus_request_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
        match &res {
            Ok(body) => info!(verb, uri = %uri, bytes = body.len(), took_ms = %t0.elapsed().as_millis(), "api: request ok"),
            Err(e) => {
                counter!("kubus_request_errors_total", 1u64, "verb" => verb);
                warn!(verb, uri = %uri, code = ?e.status_code(), error = %e, took_ms = %t0.elapsed().as_millis(), "api: request failed");
            }
        }
        res
    }

    fn decode<T: DeserializeOwned>(body: &[u8]) -> ClientResult<T> {
        Ok(serde_json::from_slice(body)?)
    }

    /// List items usually omit `kind`/`apiVersion`; fill them from the descriptor.
    fn backfill(&self, mut items: Vec<ResourceInstance>) -> Vec<ResourceInstance> {
        for item in items.iter_mut() {
            if item.kind.is_none() { item.kind = Some(self.descriptor.kind.clone()); }
            if item.api_version.is_none() { item.api_version = Some(self.descriptor.group_version()); }
        }
        items
    }

    pub async fn get(&self, name: &str, namespace: Option<&str>) -> ClientResult<ResourceInstance> {
        let path = self.path(Some(name), namespace, None)?;
        let body = self.dispatch("get", ApiRequest::get(path)).await?;
        Self::decode(&body)
    }

    /// Items in server order.
    pub async fn list(&self, namespace: Option<&str>, opts: &ListOptions) -> ClientResult<Vec<ResourceInstance>> {
        let path = self.path(None, namespace, None)?;
        let mut q = Query::new();
        opts.apply(&mut q);
        let body = self.dispatch("list", ApiRequest::get(path).with_query(q)).await?;
        let list: ResourceList = Self::decode(&body)?;
        Ok(self.backfill(list.items))
    }

    pub async fn create_resource(&self, resource: &ResourceInstance) -> ClientResult<ResourceInstance> {
        let path = self.path(None, resource.namespace(), None)?;
        let body = serde_json::to_vec(resource)?;
        let out = self.dispatch("create", ApiRequest::post(path).with_body(body, JSON)).await?;
        Self::decode(&out)
    }

    /// Full replace. The resource must carry `metadata.resourceVersion`; a stale
    /// version comes back as `ClientError::Conflict`.
    pub async fn update_resource(&self, resource: &ResourceInstance) -> ClientResult<ResourceInstance> {
        let name = resource.name().ok_or_else(|| ClientError::Configuration("update requires metadata.name".into()))?;
        if resource.resource_version().map_or(true, str::is_empty) {
            return Err(ClientError::Configuration(format!("update of {} requires metadata.resourceVersion", name)));
        }
        let path = self.path(Some(name), resource.namespace(), None)?;
        let body = serde_json::to_vec(resource)?;
        let out = self.dispatch("update", ApiRequest::put(path).with_body(body, JSON)).await?;
        Self::decode(&out)
    }

    /// Merge patch (`strategic` selects the strategic-merge content type).
    pub async fn merge_patch<P: Serialize + ?Sized>(
        &self,
        name: &str,
        patch: &P,
        namespace: Option<&str>,
        strategic: bool,
    ) -> ClientResult<ResourceInstance> {
        self.merge_patch_bytes(name, serde_json::to_vec(patch)?, namespace, strategic).await
    }

    /// Merge patch with a pre-encoded body, sent as-is.
    pub async fn merge_patch_bytes(
        &self,
        name: &str,
        body: Vec<u8>,
        namespace: Option<&str>,
        strategic: bool,
    ) -> ClientResult<ResourceInstance> {
        let path = self.path(Some(name), namespace, None)?;
        let content_type = if strategic { STRATEGIC_MERGE_PATCH } else { MERGE_PATCH };
        let out = self.dispatch("patch", ApiRequest::patch(path).with_body(body, content_type)).await?;
        Self::decode(&out)
    }

    /// RFC 6902 patch; `ops` is the operations array.
    pub async fn json_patch(&self, name: &str, ops: &serde_json::Value, namespace: Option<&str>) -> ClientResult<ResourceInstance> {
        if !ops.is_array() {
            return Err(ClientError::Configuration("json patch must be an array of operations".into()));
        }
        let path = self.path(Some(name), namespace, None)?;
        let body = serde_json::to_vec(ops)?;
        let out = self.dispatch("patch", ApiRequest::patch(path).with_body(body, JSON_PATCH)).await?;
        Self::decode(&out)
    }

    async fn delete_request(&self, path: String, mut q: Query, opts: &DeleteOptions) -> ClientResult<ApiRequest> {
        if self.transport.need_delete_body().await? {
            Ok(ApiRequest::delete(path).with_query(q).with_body(opts.document()?, JSON))
        } else {
            opts.apply_query(&mut q);
            Ok(ApiRequest::delete(path).with_query(q))
        }
    }

    /// Returns the deleted representation as reported by the server.
    pub async fn delete(&self, name: &str, namespace: Option<&str>, opts: &DeleteOptions) -> ClientResult<ResourceInstance> {
        let path = self.path(Some(name), namespace, None)?;
        let req = self.delete_request(path, Query::new(), opts).await?;
        let out = self.dispatch("delete", req).await?;
        Self::decode(&out)
    }

    pub async fn delete_collection(
        &self,
        namespace: Option<&str>,
        list: &ListOptions,
        opts: &DeleteOptions,
    ) -> ClientResult<Vec<ResourceInstance>> {
        let path = self.path(None, namespace, None)?;
        let mut q = Query::new();
        list.apply(&mut q);
        let req = self.delete_request(path, q, opts).await?;
        let out = self.dispatch("deletecollection", req).await?;
        let list: ResourceList = Self::decode(&out)?;
        Ok(self.backfill(list.items))
    }

    pub async fn delete_resource(&self, resource: &ResourceInstance, opts: &DeleteOptions) -> ClientResult<ResourceInstance> {
        let name = resource.name().ok_or_else(|| ClientError::Configuration("delete requires metadata.name".into()))?;
        self.delete(name, resource.namespace(), opts).await
    }

    /// Opens a watch on the collection. Connection failures are returned here;
    /// later failures arrive as the stream's last item.
    pub async fn watch(&self, namespace: Option<&str>, opts: &WatchOptions) -> ClientResult<WatchStream> {
        self.ensure_verb("watch")?;
        let path = self.path(None, namespace, None)?;
        WatchStream::new(path, opts).connect(self.transport.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubus_kubehub::mock::MockTransport;
    use serde_json::json;

    fn pods(mock: &Arc<MockTransport>) -> ResourceClient {
        ResourceClient::new(mock.clone(), ResourceDescriptor::new("v1", "pods", "Pod", true))
    }

    #[tokio::test]
    async fn default_namespace_applies_when_none_given() {
        let mock = Arc::new(MockTransport::new());
        mock.push_json(&json!({"kind": "Pod", "metadata": {"name": "p", "namespace": "dev"}}));
        mock.push_json(&json!({"kind": "Pod", "metadata": {"name": "p", "namespace": "prod"}}));
        let client = pods(&mock).with_namespace("dev");
        client.get("p", None).await.expect("get");
        client.get("p", Some("prod")).await.expect("get");
        let paths: Vec<_> = mock.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/api/v1/namespaces/dev/pods/p", "/api/v1/namespaces/prod/pods/p"]);
    }

    #[tokio::test]
    async fn update_without_resource_version_is_rejected_locally() {
        let mock = Arc::new(MockTransport::new());
        let client = pods(&mock);
        let mut pod = ResourceInstance::new("v1", "Pod", "p");
        pod.metadata.namespace = Some("default".into());
        let err = client.update_resource(&pod).await.unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)), "got {err:?}");
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn conflict_is_surfaced_without_retry() {
        let mock = Arc::new(MockTransport::new());
        mock.push_error(ClientError::from_status(409, br#"{"kind":"Status","message":"the object has been modified"}"#));
        let client = pods(&mock);
        let mut pod = ResourceInstance::new("v1", "Pod", "p");
        pod.metadata.namespace = Some("default".into());
        pod.metadata.resource_version = Some("7".into());
        let err = client.update_resource(&pod).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn delete_with_body_sends_options_document() {
        let mock = Arc::new(MockTransport::new().with_delete_body(true));
        mock.push_json(&json!({"kind": "Pod", "metadata": {"name": "p", "namespace": "default"}}));
        let opts = DeleteOptions { propagation_policy: Some(PropagationPolicy::Foreground), grace_period_seconds: Some(0) };
        pods(&mock).delete("p", Some("default"), &opts).await.expect("delete");
        let req = mock.last_request().expect("request");
        assert!(req.query.is_empty());
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        let doc: serde_json::Value = serde_json::from_slice(req.body.as_deref().expect("body")).expect("json");
        assert_eq!(doc, json!({"kind": "DeleteOptions", "apiVersion": "v1", "propagationPolicy": "Foreground", "gracePeriodSeconds": 0}));
    }

    #[tokio::test]
    async fn delete_without_body_moves_options_to_query() {
        let mock = Arc::new(MockTransport::new().with_delete_body(false));
        mock.push_json(&json!({"kind": "Pod", "metadata": {"name": "p", "namespace": "default"}}));
        let opts = DeleteOptions { propagation_policy: Some(PropagationPolicy::Orphan), grace_period_seconds: None };
        pods(&mock).delete("p", Some("default"), &opts).await.expect("delete");
        let req = mock.last_request().expect("request");
        assert!(req.body.is_none());
        assert_eq!(req.uri(), "/api/v1/namespaces/default/pods/p?propagationPolicy=Orphan");
    }

    #[tokio::test]
    async fn json_patch_requires_operation_array() {
        let mock = Arc::new(MockTransport::new());
        mock.push_json(&json!({"kind": "Pod", "metadata": {"name": "p"}}));
        let client = pods(&mock);
        assert!(matches!(client.json_patch("p", &json!({"op": "add"}), Some("default")).await, Err(ClientError::Configuration(_))));
        let ops = json!([{"op": "replace", "path": "/spec/activeDeadlineSeconds", "value": 5}]);
        client.json_patch("p", &ops, Some("default")).await.expect("patch");
        let req = mock.last_request().expect("request");
        assert_eq!(req.header("Content-Type"), Some("application/json-patch+json"));
        assert_eq!(req.body.as_deref(), Some(serde_json::to_vec(&ops).expect("ser").as_slice()));
    }

    #[tokio::test]
    async fn undecodable_body_is_decode_error() {
        let mock = Arc::new(MockTransport::new());
        mock.push_response("<html>proxy error</html>");
        let err = pods(&mock).get("p", Some("default")).await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)), "got {err:?}");
    }
}
