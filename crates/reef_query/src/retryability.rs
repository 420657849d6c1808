//! Retryability classification for query-plane HTTP responses.
//!
//! Mostly status-driven, with two body heuristics: a 404 is retryable
//! (the node may simply not host the service yet) unless the body names a
//! missing resource, and a 500 is retryable unless it names a missing view.
//! A structured error channel would beat substring matching; the servers do
//! not offer one on these endpoints.

/// Whether a failed query-plane response is worth retrying elsewhere.
pub fn is_retryable_http(status: u16, body: &str) -> bool {
    match status {
        200 => false,
        300..=303 | 307 => true,
        408 | 409 | 412 | 416 | 417 => true,
        502 | 503 | 504 => true,
        404 => {
            let body = body.to_ascii_lowercase();
            let names_resource = (body.contains("not_found") || body.contains("not found"))
                && (body.contains("missing") || body.contains("deleted"));
            !names_resource
        }
        500 => {
            let body = body.to_ascii_lowercase();
            !body.contains("missing_named_view") && !body.contains("missing named view")
        }
        400..=499 => false,
        _ => false,
    }
}
