//! Immutable cluster-map snapshots.
//!
//! A snapshot is parsed from the cluster manager's bucket-config JSON blob
//! (`/pools/default/b/<bucket>` or the blob embedded in a not-my-vbucket
//! response). It is never mutated: topology changes install a whole new
//! snapshot behind the [`crate::map::MapHandle`].

use serde::Deserialize;

use reef_common::error::{QueryError, ReefError, ReefResult, RoutingError};
use reef_common::types::{NodeId, PartitionId, ReplicaIndex};

/// A query-plane or data-plane service a node may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Kv,
    Mgmt,
    Views,
    Query,
    Search,
    Analytics,
}

/// One data node as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub hostname: String,
    pub kv_port: Option<u16>,
    pub mgmt_port: Option<u16>,
    pub views_port: Option<u16>,
    pub query_port: Option<u16>,
    pub search_port: Option<u16>,
    pub analytics_port: Option<u16>,
}

impl NodeEntry {
    pub fn port_for(&self, service: Service) -> Option<u16> {
        match service {
            Service::Kv => self.kv_port,
            Service::Mgmt => self.mgmt_port,
            Service::Views => self.views_port,
            Service::Query => self.query_port,
            Service::Search => self.search_port,
            Service::Analytics => self.analytics_port,
        }
    }

    /// `host:port` for a service, when the node runs it.
    pub fn addr_for(&self, service: Service) -> Option<String> {
        self.port_for(service)
            .map(|p| format!("{}:{}", self.hostname, p))
    }
}

/// Immutable topology snapshot.
///
/// `partition_map[p]` is `[owner, replica1, …]` as indices into `nodes`;
/// `-1` marks a slot with no server (mid-rebalance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub rev: u64,
    pub bucket: String,
    pub nodes: Vec<NodeEntry>,
    pub partition_map: Vec<Vec<i32>>,
    pub num_replicas: usize,
    pub capabilities: Vec<String>,
}

impl ClusterSnapshot {
    pub fn num_partitions(&self) -> usize {
        self.partition_map.len()
    }

    /// Node serving `partition` at `replica` (0 = owner).
    pub fn node_for(
        &self,
        partition: PartitionId,
        replica: ReplicaIndex,
    ) -> ReefResult<NodeId> {
        let chain = self
            .partition_map
            .get(partition.0 as usize)
            .ok_or(RoutingError::NoNode { partition, replica })?;
        match chain.get(replica.0 as usize) {
            Some(&idx) if idx >= 0 && (idx as usize) < self.nodes.len() => {
                Ok(NodeId(idx as u32))
            }
            _ => Err(ReefError::Routing(RoutingError::NoNode { partition, replica })),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id.0 as usize)
    }

    /// All nodes hosting `service`, in node-list order.
    pub fn nodes_with_service(&self, service: Service) -> Vec<(NodeId, &NodeEntry)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.port_for(service).is_some())
            .map(|(i, n)| (NodeId(i as u32), n))
            .collect()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }

    /// Parse a bucket-config blob. `origin_host` replaces the `$HOST`
    /// placeholder the manager emits when it does not know its public name.
    pub fn parse(blob: &[u8], origin_host: &str) -> ReefResult<ClusterSnapshot> {
        let wire: WireConfig = serde_json::from_slice(blob).map_err(|e| {
            ReefError::Query(QueryError::ParseError(format!("bucket config: {}", e)))
        })?;
        Ok(wire.into_snapshot(origin_host))
    }
}

// ── Wire format ──────────────────────────────────────────────────────────
//
// Unknown fields are ignored throughout so newer servers keep working.

#[derive(Debug, Deserialize)]
struct WireConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "nodesExt")]
    nodes_ext: Vec<WireNode>,
    #[serde(default, rename = "vBucketServerMap")]
    server_map: Option<WireServerMap>,
    #[serde(default, rename = "clusterCapabilities")]
    capabilities: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: WireServices,
}

#[derive(Debug, Default, Deserialize)]
struct WireServices {
    #[serde(default)]
    kv: Option<u16>,
    #[serde(default)]
    mgmt: Option<u16>,
    #[serde(default)]
    capi: Option<u16>,
    #[serde(default)]
    n1ql: Option<u16>,
    #[serde(default)]
    fts: Option<u16>,
    #[serde(default)]
    cbas: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct WireServerMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: usize,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

impl WireConfig {
    fn into_snapshot(self, origin_host: &str) -> ClusterSnapshot {
        let nodes = self
            .nodes_ext
            .into_iter()
            .map(|n| {
                let hostname = match n.hostname {
                    Some(h) if h != "$HOST" && !h.is_empty() => h,
                    _ => origin_host.to_string(),
                };
                NodeEntry {
                    hostname,
                    kv_port: n.services.kv,
                    mgmt_port: n.services.mgmt,
                    views_port: n.services.capi,
                    query_port: n.services.n1ql,
                    search_port: n.services.fts,
                    analytics_port: n.services.cbas,
                }
            })
            .collect();

        let (num_replicas, partition_map) = match self.server_map {
            Some(m) => (m.num_replicas, m.vbucket_map),
            None => (0, Vec::new()),
        };

        let capabilities = match self.capabilities {
            Some(serde_json::Value::Object(map)) => map
                .into_iter()
                .flat_map(|(section, v)| match v {
                    serde_json::Value::Array(items) => items
                        .into_iter()
                        .filter_map(move |i| {
                            i.as_str().map(|s| format!("{}.{}", section, s))
                        })
                        .collect::<Vec<_>>(),
                    _ => Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        };

        ClusterSnapshot {
            rev: self.rev,
            bucket: self.name,
            nodes,
            partition_map,
            num_replicas,
            capabilities,
        }
    }
}
