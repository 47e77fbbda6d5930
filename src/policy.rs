//! Configuration options which alter onboarding and eviction behavior.

use tokio::time::Duration;

/// Policy which is applicable to a lifecycle manager.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Time between eviction ticks for one run.
    pub check_interval: Duration,

    /// Total window during which superseded-but-healthy targets are kept
    /// before the final tick deletes them regardless. The per-run retry
    /// budget is `keep_time / check_interval`.
    pub keep_time: Duration,

    /// Re-onboarding the same generation after this much quiet time is
    /// treated as an unexpected redeploy and triggers a one-shot cleanup
    /// of unhealthy stale targets.
    pub unexpected_redeploy_threshold: Duration,

    /// Whether superseded generations are actively evicted at all.
    pub active_eviction: bool,

    /// Fixed wait after creating a remote upstream before targets are
    /// registered against it. The control plane needs time to converge
    /// the new object; this is a deliberate fixed delay, not a poll.
    pub create_grace: Duration,
}

impl Policy {
    /// Number of re-checks granted to a single eviction run.
    pub fn retry_budget(&self) -> u32 {
        (self.keep_time.as_secs() / self.check_interval.as_secs().max(1)) as u32
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            keep_time: Duration::from_secs(1800),
            unexpected_redeploy_threshold: Duration::from_secs(600),
            active_eviction: true,
            create_grace: Duration::from_secs(5),
        }
    }
}
