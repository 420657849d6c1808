//! Client facade: connect to a cluster, read and write documents, run
//! queries. Owns the lifetime of every subcomponent; dropping (or closing)
//! the [`Cluster`] tears down the config subscription and the pools.
//!
//! ```no_run
//! use reef_client::Cluster;
//!
//! # async fn run() -> reef_common::ReefResult<()> {
//! let cluster = Cluster::connect(
//!     "couchbase://db1.example.com?kv_timeout=2500",
//!     "app_user",
//!     "app_password",
//!     Some("travel"),
//! )
//! .await?;
//! let bucket = cluster.bucket();
//! bucket.upsert(b"user::1", br#"{"name":"ada"}"#.to_vec()).await?;
//! let doc = bucket.get(b"user::1").await?;
//! # drop(doc);
//! cluster.close();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use reef_common::config::{ClientConfig, ConnectionString};
use reef_common::error::ReefResult;
use reef_common::types::{Cas, Deadline, ReplicaIndex};
use reef_kv::dispatcher::{
    CounterResult, GetResult, MutationResult, ObserveResult, StoreOptions,
};
use reef_kv::KvDispatcher;
use reef_query::{
    AnalyticsRequest, N1qlRequest, QueryClient, QueryResult, SearchRequest, ViewQuery,
};
use reef_topology::{ConfigProvider, MapHandle, ProviderConfig};

pub use reef_common::observability::init_tracing;
pub use reef_common::ReefError;

/// A connected cluster.
pub struct Cluster {
    cfg: ClientConfig,
    provider: Arc<ConfigProvider>,
    dispatcher: Arc<KvDispatcher>,
    query: QueryClient,
    provider_task: JoinHandle<()>,
}

impl Cluster {
    /// Parse a connection string, connect, and bootstrap the cluster map.
    pub async fn connect(
        connstr: &str,
        username: &str,
        password: &str,
        bucket: Option<&str>,
    ) -> ReefResult<Cluster> {
        let mut cfg = ConnectionString::parse(connstr)?.into_config()?;
        cfg.username = username.to_string();
        cfg.password = password.to_string();
        cfg.bucket = bucket.map(str::to_string);
        Self::with_config(cfg).await
    }

    /// Connect from an already-assembled configuration.
    pub async fn with_config(cfg: ClientConfig) -> ReefResult<Cluster> {
        let map = Arc::new(MapHandle::new());
        let provider = ConfigProvider::new(ProviderConfig::from_client_config(&cfg), map.clone());
        let dispatcher = KvDispatcher::new(&cfg, provider.clone());
        provider.set_kv_fetcher(dispatcher.clone());

        provider
            .bootstrap(Deadline::after(cfg.connect_timeout))
            .await?;
        let provider_task = provider.start();

        let query = QueryClient::new(&cfg, map);
        tracing::info!(
            bucket = cfg.bucket.as_deref().unwrap_or(""),
            seeds = cfg.seeds.len(),
            "cluster connected"
        );
        Ok(Cluster {
            cfg,
            provider,
            dispatcher,
            query,
            provider_task,
        })
    }

    /// Handle for document operations on the connected bucket.
    pub fn bucket(&self) -> Bucket {
        Bucket {
            dispatcher: self.dispatcher.clone(),
            kv_timeout: self.cfg.kv_timeout,
        }
    }

    /// The KV dispatcher, for explicit-deadline calls.
    pub fn kv(&self) -> &Arc<KvDispatcher> {
        &self.dispatcher
    }

    /// SQL-like query with the configured query timeout.
    pub async fn n1ql(&self, req: N1qlRequest) -> ReefResult<QueryResult> {
        self.query.n1ql(req, self.query.default_deadline()).await
    }

    /// Full-text search with the configured query timeout.
    pub async fn search(&self, req: SearchRequest) -> ReefResult<QueryResult> {
        self.query.search(req, self.query.default_deadline()).await
    }

    /// Map-reduce view with the configured query timeout.
    pub async fn view(&self, req: ViewQuery) -> ReefResult<QueryResult> {
        self.query.view(req, self.query.default_deadline()).await
    }

    /// Analytics with the configured query timeout.
    pub async fn analytics(&self, req: AnalyticsRequest) -> ReefResult<QueryResult> {
        self.query
            .analytics(req, self.query.default_deadline())
            .await
    }

    /// Query entry points with explicit deadlines.
    pub fn query(&self) -> &QueryClient {
        &self.query
    }

    /// NOOP every pooled connection; returns per-peer latencies.
    pub async fn ping(&self) -> Vec<(String, ReefResult<Duration>)> {
        self.dispatcher
            .ping(Deadline::after(self.cfg.kv_timeout))
            .await
    }

    /// Stop the config subscription and close every connection.
    pub fn close(&self) {
        self.provider.stop();
        self.provider_task.abort();
        self.dispatcher.shutdown();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

/// Document operations, bounded by the configured KV timeout. Use
/// [`Cluster::kv`] for explicit deadlines.
pub struct Bucket {
    dispatcher: Arc<KvDispatcher>,
    kv_timeout: Duration,
}

impl Bucket {
    fn deadline(&self) -> Deadline {
        Deadline::after(self.kv_timeout)
    }

    pub async fn get(&self, key: &[u8]) -> ReefResult<GetResult> {
        self.dispatcher.get(key, self.deadline()).await
    }

    pub async fn get_from_replica(
        &self,
        key: &[u8],
        replica: ReplicaIndex,
    ) -> ReefResult<GetResult> {
        self.dispatcher
            .get_from_replica(key, replica, self.deadline())
            .await
    }

    pub async fn get_and_touch(&self, key: &[u8], expiry: u32) -> ReefResult<GetResult> {
        self.dispatcher
            .get_and_touch(key, expiry, self.deadline())
            .await
    }

    pub async fn upsert(&self, key: &[u8], value: Vec<u8>) -> ReefResult<MutationResult> {
        self.dispatcher
            .upsert(key, value, StoreOptions::default(), self.deadline())
            .await
    }

    pub async fn upsert_with(
        &self,
        key: &[u8],
        value: Vec<u8>,
        opts: StoreOptions,
    ) -> ReefResult<MutationResult> {
        self.dispatcher.upsert(key, value, opts, self.deadline()).await
    }

    pub async fn insert(&self, key: &[u8], value: Vec<u8>) -> ReefResult<MutationResult> {
        self.dispatcher
            .insert(key, value, StoreOptions::default(), self.deadline())
            .await
    }

    pub async fn replace(
        &self,
        key: &[u8],
        value: Vec<u8>,
        cas: Cas,
    ) -> ReefResult<MutationResult> {
        self.dispatcher
            .replace(
                key,
                value,
                StoreOptions {
                    cas,
                    ..StoreOptions::default()
                },
                self.deadline(),
            )
            .await
    }

    pub async fn remove(&self, key: &[u8], cas: Cas) -> ReefResult<MutationResult> {
        self.dispatcher.remove(key, cas, self.deadline()).await
    }

    pub async fn touch(&self, key: &[u8], expiry: u32) -> ReefResult<MutationResult> {
        self.dispatcher.touch(key, expiry, self.deadline()).await
    }

    pub async fn append(&self, key: &[u8], value: Vec<u8>) -> ReefResult<MutationResult> {
        self.dispatcher
            .append(key, value, Cas::NONE, self.deadline())
            .await
    }

    pub async fn prepend(&self, key: &[u8], value: Vec<u8>) -> ReefResult<MutationResult> {
        self.dispatcher
            .prepend(key, value, Cas::NONE, self.deadline())
            .await
    }

    pub async fn increment(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
    ) -> ReefResult<CounterResult> {
        self.dispatcher
            .increment(key, delta, initial, 0, self.deadline())
            .await
    }

    pub async fn decrement(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
    ) -> ReefResult<CounterResult> {
        self.dispatcher
            .decrement(key, delta, initial, 0, self.deadline())
            .await
    }

    pub async fn observe(&self, key: &[u8]) -> ReefResult<ObserveResult> {
        self.dispatcher.observe(key, self.deadline()).await
    }
}
