//! Failure classification → back-off → retry, bounded only by the caller's
//! deadline (there is no attempt budget).

use std::time::Duration;

use rand::Rng;

use reef_common::error::{FailureKind, KvError, ReefError};
use reef_common::types::Deadline;

/// What the dispatcher should do with a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Sleep this long, then run the next attempt.
    Wait(Duration),
    /// Give up with this error.
    Stop(ReefError),
}

/// Back-off policy: exponential with full jitter.
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetrySupervisor {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(500),
        }
    }
}

impl RetrySupervisor {
    /// Classify `err` after `attempt` failed tries.
    ///
    /// A topology move retries with zero delay when a fresher map is already
    /// installed; waiting would only delay routing to the right node.
    /// `Stop(Timeout)` is returned when the wake time would pass `deadline`.
    pub fn decide(
        &self,
        err: ReefError,
        attempt: u32,
        deadline: Deadline,
        idempotent: bool,
        fresher_map_available: bool,
    ) -> RetryDecision {
        let kind = match &err {
            // Unknown statuses are only safe to replay for idempotent ops.
            ReefError::Kv(KvError::Unknown { .. }) if idempotent => FailureKind::Transient,
            e => e.kind(),
        };

        let wait = match kind {
            FailureKind::Domain | FailureKind::Fatal => return RetryDecision::Stop(err),
            FailureKind::Retryable if fresher_map_available => Duration::ZERO,
            FailureKind::Retryable | FailureKind::Transient => self.backoff(attempt),
        };

        if deadline.remaining() <= wait {
            return RetryDecision::Stop(ReefError::timeout());
        }
        RetryDecision::Wait(wait)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.min(16));
        let ceiling = self.cap.min(self.base.saturating_mul(exp));
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_common::error::{RoutingError, TransportError};

    fn far_deadline() -> Deadline {
        Deadline::after(Duration::from_secs(60))
    }

    fn nmv() -> ReefError {
        ReefError::Routing(RoutingError::NotMyPartition { config: None })
    }

    #[tokio::test]
    async fn test_domain_failures_stop_immediately() {
        let sup = RetrySupervisor::default();
        let decision = sup.decide(
            ReefError::Kv(KvError::KeyNotFound),
            0,
            far_deadline(),
            true,
            false,
        );
        assert!(matches!(
            decision,
            RetryDecision::Stop(ReefError::Kv(KvError::KeyNotFound))
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_wait_under_cap() {
        let sup = RetrySupervisor::default();
        for attempt in 0..20 {
            match sup.decide(
                ReefError::Kv(KvError::TmpFail),
                attempt,
                far_deadline(),
                false,
                false,
            ) {
                RetryDecision::Wait(d) => assert!(d <= sup.cap),
                other => panic!("expected Wait, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_first_attempt_bounded_by_base() {
        let sup = RetrySupervisor::default();
        for _ in 0..50 {
            match sup.decide(
                ReefError::Kv(KvError::TmpFail),
                0,
                far_deadline(),
                false,
                false,
            ) {
                RetryDecision::Wait(d) => assert!(d <= sup.base),
                other => panic!("expected Wait, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_topology_move_with_fresh_map_retries_at_once() {
        let sup = RetrySupervisor::default();
        match sup.decide(nmv(), 3, far_deadline(), false, true) {
            RetryDecision::Wait(d) => assert_eq!(d, Duration::ZERO),
            other => panic!("expected Wait(0), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_status_retries_only_when_idempotent() {
        let sup = RetrySupervisor::default();
        let unknown = || {
            ReefError::Kv(KvError::Unknown {
                status: 0x00a0,
                context: None,
            })
        };
        assert!(matches!(
            sup.decide(unknown(), 0, far_deadline(), true, false),
            RetryDecision::Wait(_)
        ));
        assert!(matches!(
            sup.decide(unknown(), 0, far_deadline(), false, false),
            RetryDecision::Stop(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_with_timeout_when_wake_would_pass_deadline() {
        let sup = RetrySupervisor {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_millis(500),
        };
        // Force a non-zero wait against an already-tight deadline.
        let deadline = Deadline::after(Duration::from_micros(1));
        let mut stopped = false;
        for _ in 0..50 {
            match sup.decide(
                ReefError::Transport(TransportError::ConnectionLost("x".into())),
                4,
                deadline,
                false,
                false,
            ) {
                RetryDecision::Stop(e) => {
                    assert!(e.is_timeout());
                    stopped = true;
                    break;
                }
                // Jitter can land under the deadline; try again.
                RetryDecision::Wait(d) => assert!(d < Duration::from_micros(1)),
            }
        }
        assert!(stopped || deadline.remaining() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_expired_deadline_always_stops() {
        let sup = RetrySupervisor::default();
        let deadline = Deadline::after(Duration::ZERO);
        match sup.decide(nmv(), 0, deadline, false, true) {
            RetryDecision::Stop(e) => assert!(e.is_timeout()),
            other => panic!("expected Stop(Timeout), got {:?}", other),
        }
    }
}
