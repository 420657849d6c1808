//! Analytics service requests.

use std::time::Duration;

use serde_json::{json, Map, Value};

/// Default server-side execution timeout.
pub const DEFAULT_ANALYTICS_TIMEOUT_MS: u64 = 75_000;

/// A statement for the analytics service.
#[derive(Debug, Clone)]
pub struct AnalyticsRequest {
    statement: String,
    named_args: Map<String, Value>,
    timeout: Option<Duration>,
}

impl AnalyticsRequest {
    pub fn new(statement: impl Into<String>) -> AnalyticsRequest {
        AnalyticsRequest {
            statement: statement.into(),
            named_args: Map::new(),
            timeout: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_args.insert(name.into(), value);
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
            .unwrap_or(DEFAULT_ANALYTICS_TIMEOUT_MS);
        body.insert("timeout".into(), json!(format!("{}ms", timeout_ms)));
        for (name, value) in &self.named_args {
            body.insert(format!("${}", name), value.clone());
        }
        Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_shape() {
        let body = AnalyticsRequest::new("SELECT VALUE d FROM dataset d")
            .named("country", json!("France"))
            .to_body();
        assert_eq!(body["statement"], "SELECT VALUE d FROM dataset d");
        assert_eq!(body["timeout"], "75000ms");
        assert_eq!(body["$country"], "France");
    }
}
