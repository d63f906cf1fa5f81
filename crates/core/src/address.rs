use crate::{ClientError, ClientResult, ResourceDescriptor};

impl ResourceDescriptor {
    /// Canonical REST path for this resource type.
    ///
    /// - cluster-scoped descriptors ignore `namespace`;
    /// - namespaced descriptors insert `/namespaces/{ns}` when a namespace is given;
    /// - naming an instance of a namespaced type requires a namespace;
    /// - `subresource` (or the descriptor's own suffix) follows the instance name;
    ///   it is dropped when no name is given.
    pub fn path(&self, name: Option<&str>, namespace: Option<&str>, subresource: Option<&str>) -> ClientResult<String> {
        let mut out = self.api_prefix();
        if self.namespaced {
            match (namespace, name) {
                (Some(ns), _) if !ns.is_empty() => {
                    out.push_str("/namespaces/");
                    out.push_str(ns);
                }
                (_, Some(n)) => {
                    return Err(ClientError::Configuration(format!(
                        "namespace is required to address {} {:?}", self.plural(), n
                    )));
                }
                _ => {}
            }
        }
        out.push('/');
        out.push_str(self.plural());

        // a subresource only applies to a named instance; without one the collection is addressed
        if let Some(n) = name.filter(|n| !n.is_empty()) {
            out.push('/');
            out.push_str(n);
            if let Some(s) = subresource.or(self.subresource()) {
                out.push('/');
                out.push_str(s);
            }
        }
        Ok(out)
    }
}

/// Ordered query parameters; repeated keys are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query(Vec<(String, String)>);

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.0.push((key.to_string(), value.to_string()));
        self
    }

    pub fn push_opt<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(v) = value { self.push(key, v); }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// `application/x-www-form-urlencoded` rendering (`/` becomes `%2F`).
    pub fn encode(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.0 { ser.append_pair(k, v); }
        ser.finish()
    }

    /// `path` or `path?query`.
    pub fn with_path(&self, path: &str) -> String {
        if self.0.is_empty() { path.to_string() } else { format!("{}?{}", path, self.encode()) }
    }
}
