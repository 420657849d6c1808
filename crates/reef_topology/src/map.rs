//! Shared handle to the current cluster snapshot.
//!
//! Readers take an `Arc` clone and keep routing against that exact snapshot
//! for the rest of their attempt; writers install a replacement wholesale.
//! The write section is a revision-checked pointer swap, so an in-flight
//! operation never observes a torn map and stale updates are dropped.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::snapshot::ClusterSnapshot;

#[derive(Default)]
pub struct MapHandle {
    current: RwLock<Option<Arc<ClusterSnapshot>>>,
    changed: Notify,
}

impl MapHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot an operation should route against, if any yet.
    pub fn load(&self) -> Option<Arc<ClusterSnapshot>> {
        self.current.read().clone()
    }

    /// Revision of the installed snapshot; `None` before bootstrap.
    pub fn rev(&self) -> Option<u64> {
        self.current.read().as_ref().map(|s| s.rev)
    }

    /// Install `next` only if it is strictly newer. Returns whether the
    /// snapshot was installed.
    pub fn apply(&self, next: ClusterSnapshot) -> bool {
        let mut slot = self.current.write();
        match slot.as_ref() {
            Some(current) if next.rev <= current.rev => {
                tracing::debug!(
                    current_rev = current.rev,
                    offered_rev = next.rev,
                    "dropping stale cluster map"
                );
                false
            }
            _ => {
                tracing::info!(
                    rev = next.rev,
                    nodes = next.nodes.len(),
                    partitions = next.num_partitions(),
                    bucket = %next.bucket,
                    "installing cluster map"
                );
                *slot = Some(Arc::new(next));
                drop(slot);
                self.changed.notify_waiters();
                true
            }
        }
    }

    /// Wake when a newer snapshot than `seen_rev` is installed.
    ///
    /// Callers race this against their deadline; a lost race is handled by
    /// re-checking `rev()` after the await.
    pub async fn wait_for_newer(&self, seen_rev: u64) {
        loop {
            let notified = self.changed.notified();
            if self.rev().map_or(false, |r| r > seen_rev) {
                return;
            }
            notified.await;
        }
    }
}
