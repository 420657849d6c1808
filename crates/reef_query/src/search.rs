//! Typed full-text search requests.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Default search-side execution timeout.
pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 75_000;

/// One sort key. Strings sort by field name (`-` prefix for descending),
/// specs produce `SearchSort`-shaped objects such as `{"by":"id"}`, and raw
/// JSON passes through untouched for server-side extensions.
#[derive(Debug, Clone)]
pub enum SearchSort {
    Field(String),
    Spec(SortSpec),
    Raw(Value),
}

impl SearchSort {
    pub fn field(name: impl Into<String>) -> SearchSort {
        SearchSort::Field(name.into())
    }

    /// Sort by document id.
    pub fn id() -> SearchSort {
        SearchSort::Spec(SortSpec {
            by: "id".into(),
            ..SortSpec::default()
        })
    }

    /// Sort by relevance score.
    pub fn score() -> SearchSort {
        SearchSort::Spec(SortSpec {
            by: "score".into(),
            ..SortSpec::default()
        })
    }

    fn to_json(&self) -> Value {
        match self {
            SearchSort::Field(name) => Value::String(name.clone()),
            SearchSort::Spec(spec) => serde_json::to_value(spec).unwrap_or(Value::Null),
            SearchSort::Raw(v) => v.clone(),
        }
    }
}

/// Object-shaped sort key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SortSpec {
    pub by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,
}

/// Highlighting controls.
#[derive(Debug, Clone, Default)]
pub struct Highlight {
    pub style: Option<String>,
    pub fields: Vec<String>,
}

/// Consistency requirement carried in `ctl.consistency`.
#[derive(Debug, Clone)]
pub struct SearchConsistency {
    pub level: String,
    /// Index name → partition consistency vector.
    pub vectors: Map<String, Value>,
}

/// A full-text search request against one index.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    index: String,
    query: Value,
    size: Option<u64>,
    from: Option<u64>,
    fields: Vec<String>,
    highlight: Option<Highlight>,
    facets: Map<String, Value>,
    explain: bool,
    sort: Vec<SearchSort>,
    timeout: Option<Duration>,
    consistency: Option<SearchConsistency>,
}

impl SearchRequest {
    /// A query-string search against `index`.
    pub fn query_string(index: impl Into<String>, query: impl Into<String>) -> SearchRequest {
        Self::with_query(index, json!({ "query": query.into() }))
    }

    /// A search with an arbitrary query node.
    pub fn with_query(index: impl Into<String>, query: Value) -> SearchRequest {
        SearchRequest {
            index: index.into(),
            query,
            size: None,
            from: None,
            fields: Vec::new(),
            highlight: None,
            facets: Map::new(),
            explain: false,
            sort: Vec::new(),
            timeout: None,
            consistency: None,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn from(mut self, from: u64) -> Self {
        self.from = Some(from);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn highlight(mut self, highlight: Highlight) -> Self {
        self.highlight = Some(highlight);
        self
    }

    pub fn facet(mut self, name: impl Into<String>, facet: Value) -> Self {
        self.facets.insert(name.into(), facet);
        self
    }

    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    /// Append sort keys; plain strings use a `-` prefix for descending.
    pub fn sort_by(mut self, keys: impl IntoIterator<Item = SearchSort>) -> Self {
        self.sort.extend(keys);
        self
    }

    pub fn sort_by_fields(
        self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.sort_by(names.into_iter().map(|n| SearchSort::Field(n.into())))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn consistency(mut self, consistency: SearchConsistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Serialize to the service body.
    pub fn to_body(&self) -> Value {
        let mut ctl = Map::new();
        let timeout_ms = self
            .timeout
            .map(|t| t.as_millis() as u64)
            .unwrap_or(DEFAULT_SEARCH_TIMEOUT_MS);
        ctl.insert("timeout".into(), json!(timeout_ms));
        if let Some(c) = &self.consistency {
            ctl.insert(
                "consistency".into(),
                json!({ "level": c.level, "vectors": c.vectors }),
            );
        }

        let mut body = Map::new();
        body.insert("query".into(), self.query.clone());
        body.insert("ctl".into(), Value::Object(ctl));
        if let Some(size) = self.size {
            body.insert("size".into(), json!(size));
        }
        if let Some(from) = self.from {
            body.insert("from".into(), json!(from));
        }
        if !self.fields.is_empty() {
            body.insert("fields".into(), json!(self.fields));
        }
        if let Some(h) = &self.highlight {
            let mut highlight = Map::new();
            if let Some(style) = &h.style {
                highlight.insert("style".into(), json!(style));
            }
            if !h.fields.is_empty() {
                highlight.insert("fields".into(), json!(h.fields));
            }
            body.insert("highlight".into(), Value::Object(highlight));
        }
        if !self.facets.is_empty() {
            body.insert("facets".into(), Value::Object(self.facets.clone()));
        }
        if self.explain {
            body.insert("explain".into(), json!(true));
        }
        if !self.sort.is_empty() {
            body.insert(
                "sort".into(),
                Value::Array(self.sort.iter().map(|s| s.to_json()).collect()),
            );
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_ctl_timeout() {
        let body = SearchRequest::query_string("idx", "whale").to_body();
        assert_eq!(body["ctl"]["timeout"], 75_000);
        assert_eq!(body["query"]["query"], "whale");
        assert!(body.get("sort").is_none());
        assert!(body.get("size").is_none());
    }

    #[test]
    fn test_string_sort_keys_serialize_verbatim() {
        let body = SearchRequest::query_string("idx", "q")
            .sort_by_fields(["name", "-age"])
            .to_body();
        assert_eq!(body["sort"], json!(["name", "-age"]));
        assert_eq!(body["ctl"], json!({"timeout": 75_000}));
    }

    #[test]
    fn test_id_sort_spec_serializes_to_by_object() {
        let body = SearchRequest::query_string("idx", "q")
            .sort_by([SearchSort::id()])
            .to_body();
        assert_eq!(body["sort"], json!([{"by": "id"}]));
    }

    #[test]
    fn test_mixed_sort_keys() {
        let body = SearchRequest::query_string("idx", "q")
            .sort_by([
                SearchSort::field("name"),
                SearchSort::Spec(SortSpec {
                    by: "field".into(),
                    field: Some("age".into()),
                    descending: Some(true),
                    ..SortSpec::default()
                }),
                SearchSort::Raw(json!({"custom": {"anything": 1}})),
            ])
            .to_body();
        assert_eq!(
            body["sort"],
            json!([
                "name",
                {"by": "field", "field": "age", "descending": true},
                {"custom": {"anything": 1}}
            ])
        );
    }

    #[test]
    fn test_full_request_shape() {
        let body = SearchRequest::with_query("travel", json!({"match": "Gili"}))
            .size(10)
            .from(20)
            .fields(["country", "name"])
            .highlight(Highlight {
                style: Some("html".into()),
                fields: vec!["name".into()],
            })
            .facet("by_country", json!({"field": "country", "size": 5}))
            .explain(true)
            .timeout(Duration::from_secs(10))
            .to_body();
        assert_eq!(body["size"], 10);
        assert_eq!(body["from"], 20);
        assert_eq!(body["fields"], json!(["country", "name"]));
        assert_eq!(body["highlight"], json!({"style": "html", "fields": ["name"]}));
        assert_eq!(body["facets"]["by_country"]["size"], 5);
        assert_eq!(body["explain"], true);
        assert_eq!(body["ctl"]["timeout"], 10_000);
    }

    #[test]
    fn test_consistency_vectors_in_ctl() {
        let mut vectors = Map::new();
        vectors.insert("idx".into(), json!({"12/uuid": 1234}));
        let body = SearchRequest::query_string("idx", "q")
            .consistency(SearchConsistency {
                level: "at_plus".into(),
                vectors,
            })
            .to_body();
        assert_eq!(body["ctl"]["consistency"]["level"], "at_plus");
        assert_eq!(body["ctl"]["consistency"]["vectors"]["idx"]["12/uuid"], 1234);
    }
}
