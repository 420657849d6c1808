//! Config provider: keeps the cluster map fresh.
//!
//! Bootstrap tries the cluster-manager HTTP endpoint and the KV
//! get-cluster-config command (injected as [`KvConfigFetcher`] to keep this
//! crate free of the data plane); whichever produces a config first wins.
//! Afterwards one long-lived streaming HTTP subscription feeds every blob to
//! the map handle. Subscription loss reconnects with exponential back-off and
//! full jitter, rotating through the seed list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use reef_common::config::{ClientConfig, Seed, DEFAULT_MGMT_PORT};
use reef_common::error::{QueryError, ReefError, ReefResult};
use reef_common::types::Deadline;

use crate::map::MapHandle;
use crate::snapshot::ClusterSnapshot;

/// Blob separator on the streaming config endpoint.
const BLOB_SEPARATOR: &[u8] = b"\n\n\n\n";

/// Everything the provider needs from the client configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub seeds: Vec<Seed>,
    pub bucket: String,
    pub username: String,
    pub password: String,
    pub enable_tls: bool,
    /// Back-off base after a lost subscription.
    pub backoff_base: Duration,
    /// Back-off cap.
    pub backoff_cap: Duration,
}

impl ProviderConfig {
    pub fn from_client_config(cfg: &ClientConfig) -> Self {
        Self {
            seeds: cfg.seeds.clone(),
            bucket: cfg.bucket.clone().unwrap_or_default(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            enable_tls: cfg.enable_tls,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
        }
    }

    fn config_url(&self, host: &str) -> String {
        let scheme = if self.enable_tls { "https" } else { "http" };
        format!(
            "{}://{}:{}/pools/default/b/{}",
            scheme, host, DEFAULT_MGMT_PORT, self.bucket
        )
    }
}

/// Seam for the KV bootstrap path: fetch a config blob over an established
/// data connection. Implemented by the KV layer and injected, so topology
/// stays independent of the socket engine.
#[async_trait]
pub trait KvConfigFetcher: Send + Sync {
    /// Returns the raw blob plus the host it was fetched from (for `$HOST`
    /// substitution).
    async fn fetch_config(&self) -> ReefResult<(Vec<u8>, String)>;
}

/// Fetches and watches cluster config updates.
pub struct ConfigProvider {
    cfg: ProviderConfig,
    http: reqwest::Client,
    map: Arc<MapHandle>,
    refresh: Notify,
    kv_fetcher: parking_lot::RwLock<Option<Arc<dyn KvConfigFetcher>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConfigProvider {
    pub fn new(cfg: ProviderConfig, map: Arc<MapHandle>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            cfg,
            http: reqwest::Client::new(),
            map,
            refresh: Notify::new(),
            kv_fetcher: parking_lot::RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn map(&self) -> &Arc<MapHandle> {
        &self.map
    }

    /// Install the KV bootstrap path once the data plane can serve it.
    pub fn set_kv_fetcher(&self, fetcher: Arc<dyn KvConfigFetcher>) {
        *self.kv_fetcher.write() = Some(fetcher);
    }

    /// Parse a blob and offer it to the map. Used by the subscription loop
    /// and for configs embedded in not-my-vbucket responses.
    pub fn apply_blob(&self, blob: &[u8], origin_host: &str) -> ReefResult<bool> {
        let snapshot = ClusterSnapshot::parse(blob, origin_host)?;
        Ok(self.map.apply(snapshot))
    }

    /// Ask for an out-of-band refresh (a not-my-vbucket without an embedded
    /// config landed). Cheap and coalescing.
    pub fn schedule_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Obtain the initial config, trying each seed's HTTP endpoint and the
    /// KV command until one wins or the deadline passes.
    pub async fn bootstrap(&self, deadline: Deadline) -> ReefResult<()> {
        let mut last_err: Option<ReefError> = None;
        let mut attempt = 0u32;
        loop {
            if self.map.load().is_some() {
                return Ok(());
            }
            if deadline.expired() {
                return Err(last_err.unwrap_or_else(ReefError::timeout));
            }
            for seed in &self.cfg.seeds {
                match self.fetch_once(&seed.host, deadline).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::debug!(host = %seed.host, error = %e, "bootstrap attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            if let Some(fetcher) = self.kv_fetcher.read().clone() {
                match fetcher.fetch_config().await {
                    Ok((blob, host)) => {
                        if self.apply_blob(&blob, &host)? {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "kv bootstrap attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            let wait = full_jitter(self.cfg.backoff_base, self.cfg.backoff_cap, attempt);
            attempt = attempt.saturating_add(1);
            if Deadline::after(wait).instant() > deadline.instant() {
                return Err(last_err.unwrap_or_else(ReefError::timeout));
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Spawn the steady-state subscription loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut attempt = 0u32;
        let mut seed_idx = 0usize;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let seed = self.cfg.seeds[seed_idx % self.cfg.seeds.len()].clone();
            seed_idx = seed_idx.wrapping_add(1);

            tokio::select! {
                res = self.subscribe_once(&seed.host) => {
                    match res {
                        Ok(()) => {
                            // Stream ended cleanly; reconnect right away.
                            attempt = 0;
                        }
                        Err(e) => {
                            let wait = full_jitter(self.cfg.backoff_base, self.cfg.backoff_cap, attempt);
                            attempt = attempt.saturating_add(1);
                            tracing::warn!(
                                host = %seed.host,
                                error = %e,
                                backoff_ms = wait.as_millis() as u64,
                                "config subscription lost"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = self.refresh.notified() => {}
                                _ = shutdown.changed() => return,
                            }
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One-shot fetch: read the first blob off the endpoint and apply it.
    async fn fetch_once(&self, host: &str, deadline: Deadline) -> ReefResult<()> {
        let url = self.cfg.config_url(host);
        let fetch = async {
            let resp = self
                .http
                .get(&url)
                .basic_auth(&self.cfg.username, Some(&self.cfg.password))
                .send()
                .await
                .map_err(|e| ReefError::Query(QueryError::Http(e.to_string())))?;
            let status = resp.status().as_u16();
            if status != 200 {
                return Err(ReefError::Query(QueryError::HttpStatus {
                    code: status,
                    body: String::new(),
                }));
            }
            let mut resp = resp;
            let mut buf = BytesMut::new();
            loop {
                match resp
                    .chunk()
                    .await
                    .map_err(|e| ReefError::Query(QueryError::Http(e.to_string())))?
                {
                    Some(chunk) => {
                        buf.extend_from_slice(&chunk);
                        if let Some(blob) = split_blob(&mut buf) {
                            self.apply_blob(&blob, host)?;
                            return Ok(());
                        }
                    }
                    None => {
                        // Non-streaming server: the whole body is one blob.
                        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                            self.apply_blob(&buf, host)?;
                            return Ok(());
                        }
                        return Err(ReefError::Query(QueryError::ParseError(
                            "empty config response".into(),
                        )));
                    }
                }
            }
        };
        match tokio::time::timeout_at(deadline.instant(), fetch).await {
            Ok(res) => res,
            Err(_) => Err(ReefError::timeout()),
        }
    }

    /// Hold one streaming subscription open, applying every blob.
    async fn subscribe_once(&self, host: &str) -> ReefResult<()> {
        let url = self.cfg.config_url(host);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send()
            .await
            .map_err(|e| ReefError::Query(QueryError::Http(e.to_string())))?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ReefError::Query(QueryError::HttpStatus {
                code: status,
                body: String::new(),
            }));
        }
        tracing::info!(host, bucket = %self.cfg.bucket, "config subscription established");

        let mut resp = resp;
        let mut buf = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                c = resp.chunk() => c.map_err(|e| ReefError::Query(QueryError::Http(e.to_string())))?,
                _ = self.refresh.notified() => {
                    // Out-of-band refresh while subscribed: the stream is
                    // already live, so just keep reading.
                    continue;
                }
            };
            match chunk {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(blob) = split_blob(&mut buf) {
                        if let Err(e) = self.apply_blob(&blob, host) {
                            tracing::warn!(error = %e, "dropping unparseable config blob");
                        }
                    }
                }
                None => {
                    if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                        let _ = self.apply_blob(&buf, host);
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Pop one `\n\n\n\n`-terminated blob off the front of `buf`, if complete.
fn split_blob(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let pos = buf
        .windows(BLOB_SEPARATOR.len())
        .position(|w| w == BLOB_SEPARATOR)?;
    let blob = buf[..pos].to_vec();
    buf.advance(pos + BLOB_SEPARATOR.len());
    if blob.iter().all(|b| b.is_ascii_whitespace()) {
        return split_blob(buf);
    }
    Some(blob)
}

/// Exponential back-off with full jitter.
fn full_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let ceiling = cap.min(base.saturating_mul(1u32 << attempt.min(16)));
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
}
