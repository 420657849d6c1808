//! Map-reduce view queries.
//!
//! Views travel as `GET` query-string options rather than a JSON body; keys
//! are JSON-encoded inside the parameter values.

use serde_json::Value;

/// A view query against one design document.
#[derive(Debug, Clone)]
pub struct ViewQuery {
    bucket: Option<String>,
    design_doc: String,
    view_name: String,
    params: Vec<(String, String)>,
}

impl ViewQuery {
    pub fn new(design_doc: impl Into<String>, view_name: impl Into<String>) -> ViewQuery {
        ViewQuery {
            bucket: None,
            design_doc: design_doc.into(),
            view_name: view_name.into(),
            params: Vec::new(),
        }
    }

    /// Query a bucket other than the connected one.
    pub fn bucket_name(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn design_doc(&self) -> &str {
        &self.design_doc
    }

    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    pub fn key(self, key: &Value) -> Self {
        self.raw_param("key", key.to_string())
    }

    pub fn keys(self, keys: &[Value]) -> Self {
        self.raw_param("keys", Value::Array(keys.to_vec()).to_string())
    }

    pub fn start_key(self, key: &Value) -> Self {
        self.raw_param("startkey", key.to_string())
    }

    pub fn end_key(self, key: &Value) -> Self {
        self.raw_param("endkey", key.to_string())
    }

    pub fn limit(self, limit: u64) -> Self {
        self.raw_param("limit", limit.to_string())
    }

    pub fn skip(self, skip: u64) -> Self {
        self.raw_param("skip", skip.to_string())
    }

    pub fn descending(self, descending: bool) -> Self {
        self.raw_param("descending", descending.to_string())
    }

    pub fn reduce(self, reduce: bool) -> Self {
        self.raw_param("reduce", reduce.to_string())
    }

    pub fn group(self, group: bool) -> Self {
        self.raw_param("group", group.to_string())
    }

    /// Index staleness: `ok`, `update_after`, or `false`.
    pub fn stale(self, mode: impl Into<String>) -> Self {
        self.raw_param("stale", mode.into())
    }

    pub fn raw_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn query_params(&self) -> Vec<(String, String)> {
        self.params.clone()
    }
}
