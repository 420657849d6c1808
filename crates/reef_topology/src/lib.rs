//! Cluster topology layer: key→partition hashing, immutable cluster-map
//! snapshots swapped behind a single shared handle, and the provider that
//! keeps the map fresh from the cluster manager.

pub mod map;
pub mod partition;
pub mod provider;
pub mod snapshot;

pub use map::MapHandle;
pub use partition::partition_for_key;
pub use provider::{ConfigProvider, KvConfigFetcher, ProviderConfig};
pub use snapshot::{ClusterSnapshot, NodeEntry, Service};
