//! Identifier newtypes shared across the workspace.

use std::fmt;

use tokio::time::{Duration, Instant};

/// Index of a data partition in `[0, num_partitions)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u16);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into a cluster snapshot's node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in a partition's replica chain. 0 is the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReplicaIndex(pub u8);

impl fmt::Display for ReplicaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compare-and-swap token: a 64-bit version stamp on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cas(pub u64);

impl Cas {
    pub const NONE: Cas = Cas(0);

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

/// Mutation token: identifies a mutation's position in a partition's
/// change history. Present on mutation results when the feature was
/// negotiated at HELLO time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub partition: PartitionId,
    pub partition_uuid: u64,
    pub seqno: u64,
}

/// An absolute point in time by which an operation must complete.
///
/// Every public call takes one of these; cancellation is cooperative at
/// suspension points, so the deadline is carried down the whole call path
/// rather than recomputed per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Deadline(Instant::now() + d)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Time left until expiry; zero once past.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// The earlier of this deadline and `now + d`.
    pub fn capped_by(&self, d: Duration) -> Self {
        Deadline(self.0.min(Instant::now() + d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_none_is_unset() {
        assert!(!Cas::NONE.is_set());
        assert!(Cas(7).is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let d = Deadline::after(Duration::from_millis(50));
        assert!(!d.expired());
        assert!(d.remaining() > Duration::ZERO);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(d.expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_capped_by_takes_earlier() {
        let far = Deadline::after(Duration::from_secs(10));
        let capped = far.capped_by(Duration::from_millis(100));
        assert!(capped.instant() < far.instant());
        // Capping by something later than the deadline is a no-op.
        let same = capped.capped_by(Duration::from_secs(60));
        assert_eq!(same.instant(), capped.instant());
    }
}
