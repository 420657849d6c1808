//! Dispatches query-plane HTTP requests and wraps the response body in the
//! streaming row reader.
//!
//! Node selection round-robins over the nodes hosting the target service in
//! the current cluster snapshot. Failed responses run through the
//! retryability table and, when retryable, back off under the caller's
//! deadline with the same supervisor the data plane uses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::time::timeout_at;

use reef_common::config::ClientConfig;
use reef_common::error::{QueryError, ReefError, ReefResult, RoutingError};
use reef_common::types::Deadline;
use reef_kv::retry::{RetryDecision, RetrySupervisor};
use reef_topology::snapshot::Service;
use reef_topology::MapHandle;

use crate::analytics::AnalyticsRequest;
use crate::n1ql::N1qlRequest;
use crate::retryability::is_retryable_http;
use crate::search::SearchRequest;
use crate::streaming::{ChunkSource, RowStream};
use crate::views::ViewQuery;

/// HTTP verb for a service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMethod {
    Get,
    Post,
}

/// Shared HTTP dispatch for every query service.
pub struct QueryExecutor {
    http: reqwest::Client,
    map: Arc<MapHandle>,
    username: String,
    password: String,
    tls: bool,
    retry: RetrySupervisor,
    cursor: AtomicUsize,
}

impl QueryExecutor {
    pub fn new(cfg: &ClientConfig, map: Arc<MapHandle>) -> Arc<QueryExecutor> {
        Arc::new(QueryExecutor {
            http: reqwest::Client::new(),
            map,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            tls: cfg.enable_tls,
            retry: RetrySupervisor::default(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Bucket named by the current snapshot (for view paths).
    pub fn bucket_name(&self) -> ReefResult<String> {
        let snap = self.map.load().ok_or(RoutingError::NoMap)?;
        Ok(snap.bucket.clone())
    }

    /// `scheme://host:port` of the next node hosting `service`.
    fn base_url(&self, service: Service) -> ReefResult<String> {
        let snap = self.map.load().ok_or(RoutingError::NoMap)?;
        let nodes = snap.nodes_with_service(service);
        if nodes.is_empty() {
            return Err(ReefError::Query(QueryError::Http(format!(
                "no node hosts {:?}",
                service
            ))));
        }
        let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        let (_, node) = &nodes[pick];
        let addr = node.addr_for(service).expect("filtered on the service");
        let scheme = if self.tls { "https" } else { "http" };
        Ok(format!("{}://{}", scheme, addr))
    }

    /// Issue the request, retrying retryable failures under `deadline`, and
    /// hand back the streaming result.
    pub async fn stream_request(
        &self,
        service: Service,
        method: ServiceMethod,
        path: &str,
        body: Option<Value>,
        query: &[(String, String)],
        rows_field: &str,
        deadline: Deadline,
    ) -> ReefResult<QueryResult> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .attempt(service, method, path, body.as_ref(), query, rows_field, deadline)
                .await;
            let (retryable, err) = match outcome {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            if !retryable {
                return Err(err);
            }
            // Burn the back-off through the shared supervisor; when it says
            // stop, surface the original failure rather than a bare timeout.
            let probe = ReefError::Query(QueryError::Http(err.to_string()));
            match self.retry.decide(probe, attempt, deadline, true, false) {
                RetryDecision::Wait(wait) => {
                    tracing::debug!(
                        path,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying query request"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    attempt = attempt.saturating_add(1);
                }
                RetryDecision::Stop(_) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        service: Service,
        method: ServiceMethod,
        path: &str,
        body: Option<&Value>,
        query: &[(String, String)],
        rows_field: &str,
        deadline: Deadline,
    ) -> Result<QueryResult, (bool, ReefError)> {
        let base = self.base_url(service).map_err(|e| (true, e))?;
        let url = format!("{}{}", base, path);

        let mut req = match method {
            ServiceMethod::Get => self.http.get(&url),
            ServiceMethod::Post => self.http.post(&url),
        };
        req = req.basic_auth(&self.username, Some(&self.password));
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = match timeout_at(deadline.instant(), req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return Err((true, ReefError::Query(QueryError::Http(e.to_string()))))
            }
            Err(_) => return Err((false, ReefError::timeout())),
        };

        let status = resp.status().as_u16();
        if status == 200 {
            let source = ReqwestSource {
                resp: Some(resp),
                deadline,
            };
            return Ok(QueryResult::new(RowStream::new(
                Box::new(source),
                rows_field,
            )));
        }

        // Failure body is small; read it whole for classification.
        let body_text = match timeout_at(deadline.instant(), resp.text()).await {
            Ok(Ok(t)) => t,
            Ok(Err(_)) => String::new(),
            Err(_) => return Err((false, ReefError::timeout())),
        };
        let retryable = is_retryable_http(status, &body_text);
        Err((
            retryable,
            ReefError::Query(QueryError::HttpStatus {
                code: status,
                body: body_text,
            }),
        ))
    }
}

/// Adapter from a reqwest response body to the chunk-source seam. Chunk
/// awaits are a cooperative suspension point, so each one honors the
/// operation deadline.
struct ReqwestSource {
    resp: Option<reqwest::Response>,
    deadline: Deadline,
}

#[async_trait]
impl ChunkSource for ReqwestSource {
    async fn next_chunk(&mut self) -> ReefResult<Option<Bytes>> {
        let resp = match self.resp.as_mut() {
            Some(r) => r,
            None => return Ok(None),
        };
        match timeout_at(self.deadline.instant(), resp.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(ReefError::Query(QueryError::Http(e.to_string()))),
            Err(_) => Err(ReefError::timeout()),
        }
    }

    fn close(&mut self) {
        // Dropping the response tears down the body stream.
        self.resp = None;
    }
}

/// One query's results: a single-shot row iterator plus metadata that
/// becomes authoritative after the stream is drained.
#[derive(Debug)]
pub struct QueryResult {
    stream: RowStream,
    rows_taken: bool,
}

impl QueryResult {
    pub(crate) fn new(stream: RowStream) -> QueryResult {
        QueryResult {
            stream,
            rows_taken: false,
        }
    }

    /// The row iterator. Single-shot: a second call fails with
    /// `StreamAlreadyRead`.
    pub fn rows(&mut self) -> ReefResult<RowIter<'_>> {
        if self.rows_taken {
            return Err(ReefError::Query(QueryError::StreamAlreadyRead));
        }
        self.rows_taken = true;
        Ok(RowIter {
            stream: &mut self.stream,
        })
    }

    /// Metadata captured around the rows array; available after drain.
    pub fn metadata(&self) -> ReefResult<&serde_json::Map<String, Value>> {
        self.stream.metadata()
    }

    /// Service-reported errors block, after drain.
    pub fn errors(&self) -> ReefResult<Vec<Value>> {
        self.stream.errors()
    }

    /// Close the underlying byte stream. Idempotent.
    pub fn close(&mut self) {
        self.stream.close();
    }
}

/// Borrowing row iterator over a [`QueryResult`].
#[derive(Debug)]
pub struct RowIter<'a> {
    stream: &'a mut RowStream,
}

impl RowIter<'_> {
    pub async fn next(&mut self) -> Option<ReefResult<Value>> {
        self.stream.next_row().await
    }

    /// Drain the stream, collecting every row.
    pub async fn collect_all(mut self) -> ReefResult<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

/// Typed entry points for the four query services.
pub struct QueryClient {
    exec: Arc<QueryExecutor>,
    default_timeout: Duration,
}

impl QueryClient {
    pub fn new(cfg: &ClientConfig, map: Arc<MapHandle>) -> QueryClient {
        QueryClient {
            exec: QueryExecutor::new(cfg, map),
            default_timeout: cfg.query_timeout,
        }
    }

    pub fn default_deadline(&self) -> Deadline {
        Deadline::after(self.default_timeout)
    }

    /// SQL-like query service.
    pub async fn n1ql(&self, req: N1qlRequest, deadline: Deadline) -> ReefResult<QueryResult> {
        self.exec
            .stream_request(
                Service::Query,
                ServiceMethod::Post,
                "/query/service",
                Some(req.to_body()),
                &[],
                "results",
                deadline,
            )
            .await
    }

    /// Full-text search.
    pub async fn search(
        &self,
        req: SearchRequest,
        deadline: Deadline,
    ) -> ReefResult<QueryResult> {
        let path = format!("/{}/_search", req.index());
        self.exec
            .stream_request(
                Service::Search,
                ServiceMethod::Post,
                &path,
                Some(req.to_body()),
                &[],
                "hits",
                deadline,
            )
            .await
    }

    /// Map-reduce view.
    pub async fn view(&self, req: ViewQuery, deadline: Deadline) -> ReefResult<QueryResult> {
        let bucket = match req.bucket() {
            Some(b) => b.to_string(),
            None => self.exec.bucket_name()?,
        };
        let path = format!(
            "/{}/_design/{}/_view/{}",
            bucket,
            req.design_doc(),
            req.view_name()
        );
        self.exec
            .stream_request(
                Service::Views,
                ServiceMethod::Get,
                &path,
                None,
                &req.query_params(),
                "rows",
                deadline,
            )
            .await
    }

    /// Analytics service.
    pub async fn analytics(
        &self,
        req: AnalyticsRequest,
        deadline: Deadline,
    ) -> ReefResult<QueryResult> {
        self.exec
            .stream_request(
                Service::Analytics,
                ServiceMethod::Post,
                "/analytics/service",
                Some(req.to_body()),
                &[],
                "results",
                deadline,
            )
            .await
    }
}
