//! Routes each KV operation to the node owning its partition and turns
//! response statuses into outcomes.
//!
//! One public entry per operation; all of them run through `execute`, which
//! loads the map snapshot once per attempt, dispatches, classifies, and asks
//! the retry supervisor what to do with failures. The retry budget is the
//! caller's deadline; there is no attempt count.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::timeout_at;

use reef_common::config::ClientConfig;
use reef_common::error::{KvError, ReefError, ReefResult, RoutingError};
use reef_common::types::{Cas, Deadline, MutationToken, PartitionId, ReplicaIndex};
use reef_protocol::{
    Packet, DATATYPE_RAW, FEAT_SNAPPY, FEAT_XERROR, OP_ADD, OP_APPEND, OP_DECREMENT, OP_DELETE,
    OP_GET, OP_GET_AND_TOUCH, OP_GET_CLUSTER_CONFIG, OP_GET_REPLICA, OP_INCREMENT, OP_NOOP,
    OP_OBSERVE, OP_PREPEND, OP_REPLACE, OP_SET, OP_TOUCH, STATUS_ACCESS_ERROR, STATUS_AUTH_ERROR,
    STATUS_AUTH_STALE, STATUS_DELTA_BADVAL, STATUS_E2BIG, STATUS_EBUSY, STATUS_KEY_EEXISTS,
    STATUS_KEY_ENOENT, STATUS_LOCKED, STATUS_NOT_MY_VBUCKET, STATUS_NOT_STORED, STATUS_NO_MEMORY,
    STATUS_SUCCESS, STATUS_ETMPFAIL,
};
use reef_topology::partition::partition_for_key;
use reef_topology::snapshot::Service;
use reef_topology::{ConfigProvider, MapHandle};

use crate::compress::{maybe_compress, maybe_decompress};
use crate::connection::{ConfigSink, ConnectionConfig};
use crate::pool::NodePool;
use crate::retry::{RetryDecision, RetrySupervisor};

/// Longest key accepted by the data service.
pub const MAX_KEY_LEN: usize = 250;

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: Cas,
    pub datatype: u8,
}

/// Result of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: Cas,
    pub token: Option<MutationToken>,
}

/// Result of a counter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: Cas,
    pub token: Option<MutationToken>,
}

/// Result of an observe probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveResult {
    pub key_state: u8,
    pub cas: Cas,
}

/// Common mutation knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub flags: u32,
    /// Document expiry in seconds (0 = none).
    pub expiry: u32,
    /// Optimistic-concurrency check; `Cas::NONE` skips it.
    pub cas: Cas,
}

struct OpSpec<'a> {
    opcode: u8,
    key: &'a [u8],
    extras: Vec<u8>,
    value: Vec<u8>,
    cas: u64,
    datatype: u8,
    idempotent: bool,
    replica: ReplicaIndex,
    /// Whether the value may be transparently compressed.
    compressible: bool,
}

/// KV operation router.
pub struct KvDispatcher {
    conn_cfg: ConnectionConfig,
    map: Arc<MapHandle>,
    provider: Arc<ConfigProvider>,
    pools: DashMap<String, Arc<NodePool>>,
    retry: RetrySupervisor,
    pool_size: usize,
    acquire_timeout: std::time::Duration,
    compression_min_size: usize,
    seeds: Vec<(String, u16)>,
}

/// Forward server-pushed config blobs straight into the provider.
struct ProviderSink(Arc<ConfigProvider>);

impl ConfigSink for ProviderSink {
    fn config_blob(&self, blob: Vec<u8>, origin_host: String) {
        if let Err(e) = self.0.apply_blob(&blob, &origin_host) {
            tracing::warn!(error = %e, "dropping pushed config blob");
        }
    }
}

impl KvDispatcher {
    pub fn new(cfg: &ClientConfig, provider: Arc<ConfigProvider>) -> Arc<KvDispatcher> {
        let seeds = cfg
            .seeds
            .iter()
            .map(|s| (s.host.clone(), cfg.seed_kv_port(s)))
            .collect();
        Arc::new(KvDispatcher {
            conn_cfg: ConnectionConfig::from_client_config(cfg),
            map: provider.map().clone(),
            provider,
            pools: DashMap::new(),
            retry: RetrySupervisor::default(),
            pool_size: cfg.kv_connections(),
            acquire_timeout: cfg.acquire_timeout,
            compression_min_size: cfg.compression_min_size,
            seeds,
        })
    }

    // ── Public operations ────────────────────────────────────────────────

    pub async fn get(&self, key: &[u8], deadline: Deadline) -> ReefResult<GetResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_GET,
                    key,
                    extras: Vec::new(),
                    value: Vec::new(),
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: true,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        parse_get(resp.0)
    }

    /// Read from a replica instead of the partition owner.
    pub async fn get_from_replica(
        &self,
        key: &[u8],
        replica: ReplicaIndex,
        deadline: Deadline,
    ) -> ReefResult<GetResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_GET_REPLICA,
                    key,
                    extras: Vec::new(),
                    value: Vec::new(),
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: true,
                    replica,
                    compressible: false,
                },
                deadline,
            )
            .await?;
        parse_get(resp.0)
    }

    pub async fn get_and_touch(
        &self,
        key: &[u8],
        expiry: u32,
        deadline: Deadline,
    ) -> ReefResult<GetResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_GET_AND_TOUCH,
                    key,
                    extras: expiry.to_be_bytes().to_vec(),
                    value: Vec::new(),
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        parse_get(resp.0)
    }

    pub async fn upsert(
        &self,
        key: &[u8],
        value: Vec<u8>,
        opts: StoreOptions,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        self.store(OP_SET, key, value, opts, deadline).await
    }

    /// Create-only store; fails with `KeyExists` when the document is there.
    pub async fn insert(
        &self,
        key: &[u8],
        value: Vec<u8>,
        opts: StoreOptions,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        self.store(OP_ADD, key, value, opts, deadline).await
    }

    /// Replace-only store; fails with `KeyNotFound` when it is not.
    pub async fn replace(
        &self,
        key: &[u8],
        value: Vec<u8>,
        opts: StoreOptions,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        self.store(OP_REPLACE, key, value, opts, deadline).await
    }

    async fn store(
        &self,
        opcode: u8,
        key: &[u8],
        value: Vec<u8>,
        opts: StoreOptions,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        let mut extras = Vec::with_capacity(8);
        extras.extend_from_slice(&opts.flags.to_be_bytes());
        extras.extend_from_slice(&opts.expiry.to_be_bytes());
        let resp = self
            .execute(
                OpSpec {
                    opcode,
                    key,
                    extras,
                    value,
                    cas: opts.cas.0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: true,
                },
                deadline,
            )
            .await?;
        Ok(parse_mutation(&resp.0, resp.1))
    }

    pub async fn remove(
        &self,
        key: &[u8],
        cas: Cas,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_DELETE,
                    key,
                    extras: Vec::new(),
                    value: Vec::new(),
                    cas: cas.0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        Ok(parse_mutation(&resp.0, resp.1))
    }

    pub async fn touch(
        &self,
        key: &[u8],
        expiry: u32,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_TOUCH,
                    key,
                    extras: expiry.to_be_bytes().to_vec(),
                    value: Vec::new(),
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        Ok(parse_mutation(&resp.0, resp.1))
    }

    pub async fn append(
        &self,
        key: &[u8],
        value: Vec<u8>,
        cas: Cas,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        self.concat(OP_APPEND, key, value, cas, deadline).await
    }

    pub async fn prepend(
        &self,
        key: &[u8],
        value: Vec<u8>,
        cas: Cas,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        self.concat(OP_PREPEND, key, value, cas, deadline).await
    }

    async fn concat(
        &self,
        opcode: u8,
        key: &[u8],
        value: Vec<u8>,
        cas: Cas,
        deadline: Deadline,
    ) -> ReefResult<MutationResult> {
        let resp = self
            .execute(
                OpSpec {
                    opcode,
                    key,
                    extras: Vec::new(),
                    value,
                    cas: cas.0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: true,
                },
                deadline,
            )
            .await?;
        Ok(parse_mutation(&resp.0, resp.1))
    }

    /// Atomic add. `initial` seeds a missing counter; without it the
    /// operation fails on absent keys.
    pub async fn increment(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        deadline: Deadline,
    ) -> ReefResult<CounterResult> {
        self.counter(OP_INCREMENT, key, delta, initial, expiry, deadline)
            .await
    }

    pub async fn decrement(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        deadline: Deadline,
    ) -> ReefResult<CounterResult> {
        self.counter(OP_DECREMENT, key, delta, initial, expiry, deadline)
            .await
    }

    async fn counter(
        &self,
        opcode: u8,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        deadline: Deadline,
    ) -> ReefResult<CounterResult> {
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&delta.to_be_bytes());
        extras.extend_from_slice(&initial.unwrap_or(0).to_be_bytes());
        // All-ones expiry tells the server not to create missing keys.
        let expiry_field = if initial.is_some() { expiry } else { u32::MAX };
        extras.extend_from_slice(&expiry_field.to_be_bytes());
        let resp = self
            .execute(
                OpSpec {
                    opcode,
                    key,
                    extras,
                    value: Vec::new(),
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: false,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        let (resp, routed) = resp;
        if resp.value.len() != 8 {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::Violation(format!(
                    "counter response value of {} bytes",
                    resp.value.len()
                )),
            ));
        }
        let mut num = [0u8; 8];
        num.copy_from_slice(&resp.value);
        Ok(CounterResult {
            value: u64::from_be_bytes(num),
            cas: Cas(resp.cas),
            token: parse_mutation(&resp, routed).token,
        })
    }

    /// Probe a key's persistence state on its owner.
    pub async fn observe(&self, key: &[u8], deadline: Deadline) -> ReefResult<ObserveResult> {
        let snap = self.map.load().ok_or(RoutingError::NoMap)?;
        let p = self.partition_of(key, &snap)?;
        let mut value = Vec::with_capacity(4 + key.len());
        value.extend_from_slice(&p.0.to_be_bytes());
        value.extend_from_slice(&(key.len() as u16).to_be_bytes());
        value.extend_from_slice(key);
        let resp = self
            .execute(
                OpSpec {
                    opcode: OP_OBSERVE,
                    key: &[],
                    extras: Vec::new(),
                    value,
                    cas: 0,
                    datatype: DATATYPE_RAW,
                    idempotent: true,
                    replica: ReplicaIndex(0),
                    compressible: false,
                },
                deadline,
            )
            .await?;
        // Response body mirrors the request with state + cas appended per key.
        let body = &resp.0.value;
        if body.len() < 4 {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::Violation("short observe body".into()),
            ));
        }
        let klen = u16::from_be_bytes([body[2], body[3]]) as usize;
        let need = 4 + klen + 1 + 8;
        if body.len() < need {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::Violation("short observe body".into()),
            ));
        }
        let key_state = body[4 + klen];
        let mut cas = [0u8; 8];
        cas.copy_from_slice(&body[4 + klen + 1..need]);
        Ok(ObserveResult {
            key_state,
            cas: Cas(u64::from_be_bytes(cas)),
        })
    }

    /// One NOOP per pooled ready connection; returns per-peer latencies.
    pub async fn ping(&self, deadline: Deadline) -> Vec<(String, ReefResult<std::time::Duration>)> {
        let mut out = Vec::new();
        for entry in self.pools.iter() {
            for conn in entry.value().ready_connections() {
                let started = tokio::time::Instant::now();
                let result = conn
                    .send(Packet::request(OP_NOOP, 0), deadline)
                    .await
                    .map(|_| started.elapsed());
                out.push((conn.peer().to_string(), result));
            }
        }
        out
    }

    /// Fetch a config blob over the data plane, dialing seeds directly.
    /// This is the KV half of bootstrap, before any map exists.
    pub async fn fetch_config_from_seeds(
        &self,
        deadline: Deadline,
    ) -> ReefResult<(Vec<u8>, String)> {
        let mut last_err: Option<ReefError> = None;
        for (host, port) in &self.seeds {
            let addr = format!("{}:{}", host, port);
            let pool = self.pool_for(&addr);
            let attempt = async {
                let lease = pool.acquire(deadline.capped_by(self.acquire_timeout)).await?;
                let resp = lease
                    .send(Packet::request(OP_GET_CLUSTER_CONFIG, 0), deadline)
                    .await?;
                if resp.status() != STATUS_SUCCESS || resp.value.is_empty() {
                    return Err(ReefError::Routing(RoutingError::NoMap));
                }
                Ok(resp.value)
            };
            match attempt.await {
                Ok(blob) => return Ok((blob, host.clone())),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "seed config fetch failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ReefError::Routing(RoutingError::NoMap)))
    }

    /// Close every pooled connection.
    pub fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().close();
        }
    }

    // ── Core loop ────────────────────────────────────────────────────────

    fn partition_of(
        &self,
        key: &[u8],
        snap: &reef_topology::ClusterSnapshot,
    ) -> ReefResult<PartitionId> {
        if snap.num_partitions() == 0 {
            // A config without a partition map (not yet fully formed).
            return Err(ReefError::Routing(RoutingError::NoMap));
        }
        partition_for_key(key, snap.num_partitions())
    }

    async fn execute(
        &self,
        op: OpSpec<'_>,
        deadline: Deadline,
    ) -> ReefResult<(Packet, PartitionId)> {
        if op.opcode != OP_OBSERVE && (op.key.is_empty() || op.key.len() > MAX_KEY_LEN) {
            return Err(ReefError::InvalidArgument(format!(
                "key must be 1..={} bytes, got {}",
                MAX_KEY_LEN,
                op.key.len()
            )));
        }

        let mut attempt: u32 = 0;
        loop {
            let (err, seen_rev) = match self.attempt(&op, deadline).await {
                Ok(resp) => return Ok(resp),
                Err(outcome) => outcome,
            };
            let fresher = match (self.map.rev(), seen_rev) {
                (Some(now), Some(seen)) => now > seen,
                (Some(_), None) => true,
                (None, _) => false,
            };
            match self
                .retry
                .decide(err, attempt, deadline, op.idempotent, fresher)
            {
                RetryDecision::Wait(wait) => {
                    tracing::debug!(
                        opcode = op.opcode,
                        attempt,
                        wait_us = wait.as_micros() as u64,
                        "retrying operation"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    attempt = attempt.saturating_add(1);
                }
                RetryDecision::Stop(e) => return Err(e),
            }
        }
    }

    /// One routing + dispatch attempt. Failures carry the map revision the
    /// attempt routed against, so the retry loop can spot fresher maps.
    async fn attempt(
        &self,
        op: &OpSpec<'_>,
        deadline: Deadline,
    ) -> Result<(Packet, PartitionId), (ReefError, Option<u64>)> {
        let snap = match self.map.load() {
            Some(s) => s,
            None => return Err((ReefError::Routing(RoutingError::NoMap), None)),
        };
        let rev = Some(snap.rev);

        let p = if op.opcode == OP_OBSERVE {
            // Observe carries its key inside the body, already located.
            PartitionId(u16::from_be_bytes([op.value[0], op.value[1]]))
        } else {
            self.partition_of(op.key, &snap).map_err(|e| (e, rev))?
        };
        let node = snap.node_for(p, op.replica).map_err(|e| (e, rev))?;
        let addr = snap
            .node(node)
            .and_then(|n| n.addr_for(Service::Kv))
            .ok_or((
                ReefError::Routing(RoutingError::NoNode {
                    partition: p,
                    replica: op.replica,
                }),
                rev,
            ))?;

        let pool = self.pool_for(&addr);
        let lease = pool
            .acquire(deadline.capped_by(self.acquire_timeout))
            .await
            .map_err(|e| (e, rev))?;

        let mut packet = Packet::request(op.opcode, p.0);
        packet.key = op.key.to_vec();
        packet.extras = op.extras.clone();
        packet.cas = op.cas;
        let (datatype, value) = if op.compressible && lease.features().has(FEAT_SNAPPY) {
            maybe_compress(op.datatype, op.value.clone(), self.compression_min_size)
        } else {
            (op.datatype, op.value.clone())
        };
        packet.datatype = datatype;
        packet.value = value;

        let resp = lease.send(packet, deadline).await.map_err(|e| (e, rev))?;
        let xerror = lease.features().has(FEAT_XERROR);
        self.classify(resp, lease.host(), op, xerror)
            .map(|resp| (resp, p))
            .map_err(|e| (e, rev))
    }

    /// Turn a response status into an outcome per the dispatch table.
    fn classify(
        &self,
        resp: Packet,
        origin_host: &str,
        op: &OpSpec<'_>,
        xerror: bool,
    ) -> ReefResult<Packet> {
        match resp.status() {
            STATUS_SUCCESS => Ok(resp),
            STATUS_KEY_ENOENT => Err(KvError::KeyNotFound.into()),
            STATUS_KEY_EEXISTS => {
                // On a CAS-guarded mutation this status means the stamp
                // moved; on create-only it means the document exists.
                if op.cas != 0 {
                    Err(KvError::CasMismatch.into())
                } else {
                    Err(KvError::KeyExists.into())
                }
            }
            // Append/prepend against a missing document.
            STATUS_NOT_STORED => Err(KvError::KeyNotFound.into()),
            STATUS_DELTA_BADVAL => Err(KvError::DeltaBadVal.into()),
            STATUS_E2BIG => Err(KvError::TooBig.into()),
            STATUS_LOCKED => Err(KvError::Locked.into()),
            STATUS_NOT_MY_VBUCKET => {
                let config = if resp.value.is_empty() {
                    self.provider.schedule_refresh();
                    None
                } else {
                    if let Err(e) = self.provider.apply_blob(&resp.value, origin_host) {
                        tracing::warn!(error = %e, "embedded config in NMV response unusable");
                        self.provider.schedule_refresh();
                    }
                    Some(resp.value)
                };
                Err(RoutingError::NotMyPartition { config }.into())
            }
            STATUS_ETMPFAIL => Err(KvError::TmpFail.into()),
            STATUS_EBUSY => Err(KvError::ServerBusy.into()),
            STATUS_NO_MEMORY => Err(KvError::OutOfMemory.into()),
            STATUS_AUTH_ERROR | STATUS_AUTH_STALE | STATUS_ACCESS_ERROR => {
                Err(KvError::AccessDenied.into())
            }
            status => {
                // With extended errors negotiated the body may carry a JSON
                // context blob worth surfacing.
                let context = if xerror && !resp.value.is_empty() {
                    String::from_utf8(resp.value).ok()
                } else {
                    None
                };
                Err(KvError::Unknown { status, context }.into())
            }
        }
    }

    fn pool_for(&self, addr: &str) -> Arc<NodePool> {
        self.pools
            .entry(addr.to_string())
            .or_insert_with(|| {
                NodePool::new(
                    addr.to_string(),
                    self.conn_cfg.clone(),
                    self.pool_size,
                    Some(Arc::new(ProviderSink(self.provider.clone()))),
                )
            })
            .clone()
    }
}

#[async_trait::async_trait]
impl reef_topology::KvConfigFetcher for KvDispatcher {
    async fn fetch_config(&self) -> ReefResult<(Vec<u8>, String)> {
        // Bounded like a normal KV op; bootstrap calls this repeatedly.
        let deadline = Deadline::after(self.acquire_timeout.max(std::time::Duration::from_secs(2)));
        timeout_at(deadline.instant(), self.fetch_config_from_seeds(deadline))
            .await
            .map_err(|_| ReefError::timeout())?
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

fn parse_get(resp: Packet) -> ReefResult<GetResult> {
    let flags = match resp.extras.len() {
        0 => 0,
        n if n >= 4 => u32::from_be_bytes([
            resp.extras[0],
            resp.extras[1],
            resp.extras[2],
            resp.extras[3],
        ]),
        n => {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::Violation(format!(
                    "read response with {} extras bytes",
                    n
                )),
            ))
        }
    };
    let (datatype, value) = maybe_decompress(resp.datatype, resp.value)?;
    Ok(GetResult {
        value,
        flags,
        cas: Cas(resp.cas),
        datatype,
    })
}

fn parse_mutation(resp: &Packet, partition: PartitionId) -> MutationResult {
    // Mutation-token extras: partition uuid + sequence number.
    let token = if resp.extras.len() >= 16 {
        let mut uuid = [0u8; 8];
        uuid.copy_from_slice(&resp.extras[0..8]);
        let mut seqno = [0u8; 8];
        seqno.copy_from_slice(&resp.extras[8..16]);
        Some(MutationToken {
            partition,
            partition_uuid: u64::from_be_bytes(uuid),
            seqno: u64::from_be_bytes(seqno),
        })
    } else {
        None
    };
    MutationResult {
        cas: Cas(resp.cas),
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_protocol::DATATYPE_SNAPPY;

    #[test]
    fn test_parse_get_reads_flags_and_cas() {
        let mut resp = Packet::response(OP_GET, STATUS_SUCCESS, 1);
        resp.extras = 0xdead_0001u32.to_be_bytes().to_vec();
        resp.cas = 42;
        resp.value = b"v".to_vec();
        let got = parse_get(resp).unwrap();
        assert_eq!(got.flags, 0xdead_0001);
        assert_eq!(got.cas, Cas(42));
        assert_eq!(got.value, b"v");
    }

    #[test]
    fn test_parse_get_decompresses() {
        let raw = b"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx".to_vec();
        let compressed = snap::raw::Encoder::new().compress_vec(&raw).unwrap();
        let mut resp = Packet::response(OP_GET, STATUS_SUCCESS, 1);
        resp.extras = vec![0, 0, 0, 0];
        resp.datatype = DATATYPE_SNAPPY;
        resp.value = compressed;
        let got = parse_get(resp).unwrap();
        assert_eq!(got.value, raw);
        assert_eq!(got.datatype & DATATYPE_SNAPPY, 0);
    }

    #[test]
    fn test_parse_mutation_token() {
        let mut resp = Packet::response(OP_SET, STATUS_SUCCESS, 1);
        resp.cas = 7;
        resp.extras = [0x11u8; 16].to_vec();
        let m = parse_mutation(&resp, PartitionId(12));
        assert_eq!(m.cas, Cas(7));
        let token = m.token.unwrap();
        assert_eq!(token.partition, PartitionId(12));
        assert_eq!(token.partition_uuid, 0x1111_1111_1111_1111);
        assert_eq!(token.seqno, 0x1111_1111_1111_1111);

        let bare = Packet::response(OP_SET, STATUS_SUCCESS, 1);
        assert!(parse_mutation(&bare, PartitionId(0)).token.is_none());
    }
}
