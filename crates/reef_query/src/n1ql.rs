//! SQL-like query requests.

use std::time::Duration;

use serde_json::{json, Map, Value};

/// Default server-side execution timeout.
pub const DEFAULT_N1QL_TIMEOUT_MS: u64 = 75_000;

/// A statement for the query service.
#[derive(Debug, Clone)]
pub struct N1qlRequest {
    statement: String,
    positional_args: Vec<Value>,
    named_args: Map<String, Value>,
    scan_consistency: Option<String>,
    timeout: Option<Duration>,
}

impl N1qlRequest {
    pub fn new(statement: impl Into<String>) -> N1qlRequest {
        N1qlRequest {
            statement: statement.into(),
            positional_args: Vec::new(),
            named_args: Map::new(),
            scan_consistency: None,
            timeout: None,
        }
    }

    pub fn positional(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.positional_args.extend(args);
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_args.insert(name.into(), value);
        self
    }

    /// `not_bounded`, `request_plus`, or `at_plus`.
    pub fn scan_consistency(mut self, level: impl Into<String>) -> Self {
        self.scan_consistency = Some(level.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("statement".into(), json!(self.statement));
        let timeout_ms = self
            .timeout
            .map(|t| t.as_millis() as u64)
            .unwrap_or(DEFAULT_N1QL_TIMEOUT_MS);
        body.insert("timeout".into(), json!(format!("{}ms", timeout_ms)));
        if !self.positional_args.is_empty() {
            body.insert("args".into(), Value::Array(self.positional_args.clone()));
        }
        for (name, value) in &self.named_args {
            // Named parameters ride as `$name` top-level members.
            body.insert(format!("${}", name), value.clone());
        }
        if let Some(level) = &self.scan_consistency {
            body.insert("scan_consistency".into(), json!(level));
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_statement() {
        let body = N1qlRequest::new("SELECT 1").to_body();
        assert_eq!(body["statement"], "SELECT 1");
        assert_eq!(body["timeout"], "75000ms");
        assert!(body.get("args").is_none());
    }

    #[test]
    fn test_positional_and_named_args() {
        let body = N1qlRequest::new("SELECT * FROM t WHERE a = $limit AND b = ?")
            .positional([json!(42)])
            .named("limit", json!(10))
            .scan_consistency("request_plus")
            .timeout(Duration::from_secs(5))
            .to_body();
        assert_eq!(body["args"], json!([42]));
        assert_eq!(body["$limit"], 10);
        assert_eq!(body["scan_consistency"], "request_plus");
        assert_eq!(body["timeout"], "5000ms");
    }
}
