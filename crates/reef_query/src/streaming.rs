//! Lazy, single-pass reader for large JSON result documents.
//!
//! Result bodies look roughly like
//! `{ "<meta>": …, "rows": [ row, row, … ], "<meta>": … }` and can be far
//! larger than memory. The reader scans tokens until the designated rows
//! array, yields each element as it completes, then scans the remainder for
//! trailing metadata (including any `errors`/`warnings` blocks). At most one
//! row is buffered at a time plus a small look-ahead.
//!
//! The scanner is an explicit state machine rather than a full JSON parser:
//! it only needs to find member boundaries at the top level and balanced
//! value extents; each extracted value is handed to serde_json.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use reef_common::error::{QueryError, ReefError, ReefResult};

/// Source of response-body chunks. The reqwest adapter lives in the
/// executor; tests feed byte slices.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or `None` at end of body.
    async fn next_chunk(&mut self) -> ReefResult<Option<Bytes>>;
    /// Close the underlying byte stream. Idempotent.
    fn close(&mut self);
}

/// In-memory source, chunked to exercise resumption at every boundary.
pub struct BytesSource {
    chunks: Vec<Bytes>,
    pos: usize,
}

impl BytesSource {
    pub fn new(body: &[u8], chunk_size: usize) -> BytesSource {
        let chunk_size = chunk_size.max(1);
        let chunks = body
            .chunks(chunk_size)
            .map(|c| Bytes::copy_from_slice(c))
            .collect();
        BytesSource { chunks, pos: 0 }
    }
}

#[async_trait]
impl ChunkSource for BytesSource {
    async fn next_chunk(&mut self) -> ReefResult<Option<Bytes>> {
        let chunk = self.chunks.get(self.pos).cloned();
        self.pos += 1;
        Ok(chunk)
    }

    fn close(&mut self) {
        self.pos = self.chunks.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Scanning top-level members before the rows array.
    SeekingRows,
    /// Positioned inside the rows array, before an element.
    InRows,
    /// Scanning top-level members after the rows array.
    TailingMeta,
    Done,
    Failed,
}

/// Streaming row iterator plus post-drain metadata.
pub struct RowStream {
    source: Box<dyn ChunkSource>,
    buf: BytesMut,
    state: StreamState,
    rows_field: String,
    meta: serde_json::Map<String, Value>,
    /// Set once the leading `{` has been consumed.
    started: bool,
    closed: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("state", &self.state)
            .field("rows_field", &self.rows_field)
            .field("meta", &self.meta)
            .field("started", &self.started)
            .field("closed", &self.closed)
            .finish()
    }
}

impl RowStream {
    pub fn new(source: Box<dyn ChunkSource>, rows_field: &str) -> RowStream {
        RowStream {
            source,
            buf: BytesMut::with_capacity(8 * 1024),
            state: StreamState::SeekingRows,
            rows_field: rows_field.to_string(),
            meta: serde_json::Map::new(),
            started: false,
            closed: false,
        }
    }

    /// Next decoded row, `Some(Err(ParseError))` as the terminal item on
    /// malformed input, `None` once the array (and trailing metadata) have
    /// been consumed.
    pub async fn next_row(&mut self) -> Option<ReefResult<Value>> {
        match self.state {
            StreamState::Done | StreamState::Failed => return None,
            _ => {}
        }
        match self.advance().await {
            Ok(row) => row.map(Ok),
            Err(e) => {
                self.state = StreamState::Failed;
                self.close();
                Some(Err(e))
            }
        }
    }

    /// Read rows until the end of the stream, discarding them. Metadata is
    /// authoritative afterwards.
    pub async fn drain(&mut self) -> ReefResult<()> {
        while let Some(row) = self.next_row().await {
            row?;
        }
        Ok(())
    }

    /// Captured top-level fields. Only available once the stream has been
    /// fully drained; before that the document may still hold more of them.
    pub fn metadata(&self) -> ReefResult<&serde_json::Map<String, Value>> {
        if self.state != StreamState::Done {
            return Err(ReefError::Query(QueryError::StreamNotDrained));
        }
        Ok(&self.meta)
    }

    /// The `errors` block, when the service reported any.
    pub fn errors(&self) -> ReefResult<Vec<Value>> {
        let meta = self.metadata()?;
        Ok(match meta.get("errors") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        })
    }

    /// Close the underlying byte stream. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }

    // ── Scanner ──────────────────────────────────────────────────────────

    async fn advance(&mut self) -> ReefResult<Option<Value>> {
        if !self.started {
            match self.peek_non_ws().await? {
                Some(b'{') => {
                    self.buf.advance(1);
                    self.started = true;
                }
                _ => return Err(parse_err("document is not a JSON object")),
            }
        }

        loop {
            match self.state {
                StreamState::SeekingRows | StreamState::TailingMeta => {
                    if self.scan_member().await? {
                        // Reached the rows array start; fall through to
                        // yield elements.
                        continue;
                    }
                    if self.state == StreamState::Done {
                        return Ok(None);
                    }
                }
                StreamState::InRows => {
                    match self.peek_non_ws().await? {
                        Some(b']') => {
                            self.buf.advance(1);
                            self.state = StreamState::TailingMeta;
                            continue;
                        }
                        Some(b',') => {
                            self.buf.advance(1);
                            continue;
                        }
                        Some(_) => {
                            let raw = self.take_value().await?;
                            let row: Value = serde_json::from_slice(&raw)
                                .map_err(|e| parse_err(&format!("row: {}", e)))?;
                            return Ok(Some(row));
                        }
                        None => return Err(parse_err("body ended inside the rows array")),
                    }
                }
                StreamState::Done => return Ok(None),
                StreamState::Failed => return Ok(None),
            }
        }
    }

    /// Consume one top-level member (or the closing `}`). Returns true when
    /// the member was the rows array and the state moved to `InRows`.
    async fn scan_member(&mut self) -> ReefResult<bool> {
        loop {
            match self.peek_non_ws().await? {
                Some(b'}') => {
                    self.buf.advance(1);
                    self.state = StreamState::Done;
                    self.close();
                    return Ok(false);
                }
                Some(b',') => {
                    self.buf.advance(1);
                    continue;
                }
                Some(b'"') => {
                    let raw_key = self.take_value().await?;
                    let key: String = serde_json::from_slice(&raw_key)
                        .map_err(|e| parse_err(&format!("member name: {}", e)))?;
                    match self.peek_non_ws().await? {
                        Some(b':') => self.buf.advance(1),
                        _ => return Err(parse_err("expected ':' after member name")),
                    }
                    if self.state == StreamState::SeekingRows && key == self.rows_field {
                        match self.peek_non_ws().await? {
                            Some(b'[') => {
                                self.buf.advance(1);
                                self.state = StreamState::InRows;
                                return Ok(true);
                            }
                            _ => return Err(parse_err("rows member is not an array")),
                        }
                    }
                    let raw = self.take_value().await?;
                    let value: Value = serde_json::from_slice(&raw)
                        .map_err(|e| parse_err(&format!("member '{}': {}", key, e)))?;
                    self.meta.insert(key, value);
                }
                Some(other) => {
                    return Err(parse_err(&format!(
                        "unexpected byte 0x{:02x} between members",
                        other
                    )))
                }
                None => return Err(parse_err("body ended inside the object")),
            }
        }
    }

    /// Skip whitespace; return the next significant byte without consuming
    /// it, or `None` at end of body.
    async fn peek_non_ws(&mut self) -> ReefResult<Option<u8>> {
        loop {
            while let Some(&b) = self.buf.first() {
                if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                    self.buf.advance(1);
                } else {
                    return Ok(Some(b));
                }
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Extract one complete JSON value starting at the front of the buffer,
    /// reading more chunks as needed. The caller has already positioned a
    /// non-whitespace byte at the front.
    async fn take_value(&mut self) -> ReefResult<Vec<u8>> {
        let first = *self.buf.first().ok_or_else(|| parse_err("empty value"))?;
        let is_string = first == b'"';
        let is_container = first == b'{' || first == b'[';

        let mut pos = 0usize;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        loop {
            while pos < self.buf.len() {
                let b = self.buf[pos];
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                        if is_string && depth == 0 {
                            return Ok(self.consume(pos + 1));
                        }
                    }
                } else {
                    match b {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            if depth == 0 {
                                // A scalar ends at its enclosing delimiter.
                                return Ok(self.consume(pos));
                            }
                            depth -= 1;
                            if depth == 0 && is_container {
                                return Ok(self.consume(pos + 1));
                            }
                        }
                        b',' if depth == 0 => return Ok(self.consume(pos)),
                        b' ' | b'\t' | b'\n' | b'\r' if depth == 0 => {
                            return Ok(self.consume(pos))
                        }
                        _ => {}
                    }
                }
                pos += 1;
            }
            if !self.fill().await? {
                if in_string || depth > 0 {
                    return Err(parse_err("body ended inside a value"));
                }
                // A trailing bare scalar; the object scan reports the
                // truncation when it looks for the next member.
                return Ok(self.consume(pos));
            }
        }
    }

    /// Split off the first `n` buffered bytes.
    fn consume(&mut self, n: usize) -> Vec<u8> {
        let raw = self.buf[..n].to_vec();
        self.buf.advance(n);
        raw
    }

    async fn fill(&mut self) -> ReefResult<bool> {
        if self.closed {
            return Ok(false);
        }
        loop {
            match self.source.next_chunk().await? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    self.buf.extend_from_slice(&chunk);
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_err(msg: &str) -> ReefError {
    ReefError::Query(QueryError::ParseError(msg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_over(body: &str, chunk: usize, rows_field: &str) -> RowStream {
        RowStream::new(Box::new(BytesSource::new(body.as_bytes(), chunk)), rows_field)
    }

    async fn collect(stream: &mut RowStream) -> Vec<Value> {
        let mut rows = Vec::new();
        while let Some(row) = stream.next_row().await {
            rows.push(row.unwrap());
        }
        rows
    }

    const SEARCH_BODY: &str =
        r#"{"status":"ok","hits":[{"id":"a"},{"id":"b"}],"total_hits":2}"#;

    #[tokio::test]
    async fn test_search_shape_yields_rows_then_metadata() {
        for chunk in [1, 2, 3, 7, 1024] {
            let mut s = stream_over(SEARCH_BODY, chunk, "hits");
            let rows = collect(&mut s).await;
            assert_eq!(rows.len(), 2, "chunk size {}", chunk);
            assert_eq!(rows[0]["id"], "a");
            assert_eq!(rows[1]["id"], "b");
            let meta = s.metadata().unwrap();
            assert_eq!(meta["status"], "ok");
            assert_eq!(meta["total_hits"], 2);
        }
    }

    #[tokio::test]
    async fn test_metadata_before_drain_is_an_error() {
        let mut s = stream_over(SEARCH_BODY, 8, "hits");
        assert!(matches!(
            s.metadata().unwrap_err(),
            ReefError::Query(QueryError::StreamNotDrained)
        ));
        let _ = s.next_row().await.unwrap().unwrap();
        // One row in: still not drained.
        assert!(s.metadata().is_err());
        s.drain().await.unwrap();
        assert!(s.metadata().is_ok());
    }

    #[tokio::test]
    async fn test_rows_match_reference_parser() {
        let body = r#"{
            "took": 12,
            "rows": [
                {"k": "a", "n": [1, 2, {"deep": "]}\"tricky"}]},
                {"k": "b", "s": "with \\ escapes \" and ] brackets"},
                17,
                "bare string",
                null,
                true,
                {"empty": {}}
            ],
            "total_rows": 7,
            "warnings": [{"msg": "w1"}]
        }"#;
        let reference: Value = serde_json::from_str(body).unwrap();
        let expected = reference["rows"].as_array().unwrap();

        for chunk in [1, 3, 16, 4096] {
            let mut s = stream_over(body, chunk, "rows");
            let rows = collect(&mut s).await;
            assert_eq!(&rows, expected, "chunk size {}", chunk);
            let meta = s.metadata().unwrap();
            assert_eq!(meta["took"], 12);
            assert_eq!(meta["total_rows"], 7);
            assert_eq!(meta["warnings"][0]["msg"], "w1");
        }
    }

    #[tokio::test]
    async fn test_empty_rows_array() {
        let mut s = stream_over(r#"{"rows":[],"total_rows":0}"#, 2, "rows");
        assert!(collect(&mut s).await.is_empty());
        assert_eq!(s.metadata().unwrap()["total_rows"], 0);
    }

    #[tokio::test]
    async fn test_document_without_rows_field() {
        let mut s = stream_over(r#"{"status":"timeout","errors":[{"code":1080}]}"#, 4, "rows");
        assert!(collect(&mut s).await.is_empty());
        let errors = s.errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], 1080);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_terminal_parse_error() {
        let mut s = stream_over(r#"{"rows":[{"k": }],"x":1}"#, 4, "rows");
        let first = s.next_row().await.unwrap();
        assert!(matches!(
            first.unwrap_err(),
            ReefError::Query(QueryError::ParseError(_))
        ));
        // Terminal: iteration is over after the error item.
        assert!(s.next_row().await.is_none());
        assert!(s.metadata().is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_parse_error() {
        let mut s = stream_over(r#"{"rows":[{"k":1},{"k":"#, 4, "rows");
        let first = s.next_row().await.unwrap().unwrap();
        assert_eq!(first["k"], 1);
        let second = s.next_row().await.unwrap();
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_non_object_body_is_a_parse_error() {
        let mut s = stream_over(r#"[1,2,3]"#, 4, "rows");
        let first = s.next_row().await.unwrap();
        assert!(first.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut s = stream_over(SEARCH_BODY, 8, "hits");
        s.close();
        s.close();
        // After close the source reports end-of-body, which mid-document is
        // a parse error rather than silent truncation.
        assert!(s.next_row().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_nested_arrays_in_metadata_before_rows() {
        let body = r#"{"shards":{"ok":[1,2,3],"failed":[]},"hits":[{"id":"x"}],"n":1}"#;
        let mut s = stream_over(body, 3, "hits");
        let rows = collect(&mut s).await;
        assert_eq!(rows.len(), 1);
        let meta = s.metadata().unwrap();
        assert_eq!(meta["shards"]["ok"][2], 3);
        assert_eq!(meta["n"], 1);
    }
}
