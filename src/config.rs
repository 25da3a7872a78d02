//! Configuration for the choral control plane

use crate::resource::TopologyMode;
use std::time::Duration;

/// Policy configuration for the operator runtime.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Number of parallel reconciliation workers. Reconciliations for the
    /// same cluster are always serialized regardless of this value.
    pub workers: usize,

    /// Fallback requeue interval for quorum-mode clusters
    pub requeue_multi_master: Duration,

    /// Fallback requeue interval for primary/replica clusters
    pub requeue_primary_replica: Duration,

    /// Fallback requeue interval for unmanaged-topology clusters
    pub requeue_none: Duration,

    /// Base delay of the exponential back-off applied to transient failures
    pub backoff_base: Duration,

    /// Upper bound of the back-off schedule
    pub backoff_cap: Duration,

    /// Consecutive failed health observations of the primary before a
    /// failover is triggered (default: 3)
    pub failover_probe_threshold: u32,

    /// Bounded timeout for administrative commands against instances
    pub admin_timeout: Duration,

    /// Finalizer name placed on managed cluster resources
    pub finalizer: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_multi_master: Duration::from_secs(30),
            requeue_primary_replica: Duration::from_secs(10),
            requeue_none: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            failover_probe_threshold: 3,
            admin_timeout: Duration::from_secs(10),
            finalizer: "choral.io/topology".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of reconciliation workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the failover debounce threshold.
    pub fn with_failover_probe_threshold(mut self, threshold: u32) -> Self {
        self.failover_probe_threshold = threshold;
        self
    }

    /// Set the transient-failure back-off schedule.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Set the admin command timeout.
    pub fn with_admin_timeout(mut self, timeout: Duration) -> Self {
        self.admin_timeout = timeout;
        self
    }

    /// Fallback requeue interval for the given topology mode.
    pub fn requeue_for(&self, mode: TopologyMode) -> Duration {
        match mode {
            TopologyMode::MultiMaster => self.requeue_multi_master,
            TopologyMode::PrimaryReplica => self.requeue_primary_replica,
            TopologyMode::None => self.requeue_none,
        }
    }

    /// Exponential back-off delay for the given attempt count, capped.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_cap)
    }

    /// Validate policy knobs. Invalid values are a configuration error, not
    /// something to silently clamp.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.failover_probe_threshold == 0 {
            return Err("failover_probe_threshold must be at least 1".to_string());
        }
        if self.backoff_base.is_zero() {
            return Err("backoff_base must be non-zero".to_string());
        }
        if self.backoff_cap < self.backoff_base {
            return Err("backoff_cap must be >= backoff_base".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OperatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = OperatorConfig::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(config.backoff_for(0), Duration::from_secs(1));
        assert_eq!(config.backoff_for(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_requeue_interval_per_topology() {
        let config = OperatorConfig::default();
        assert_eq!(
            config.requeue_for(TopologyMode::MultiMaster),
            config.requeue_multi_master
        );
        assert_eq!(
            config.requeue_for(TopologyMode::PrimaryReplica),
            config.requeue_primary_replica
        );
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = OperatorConfig::default().with_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let config = OperatorConfig::default()
            .with_backoff(Duration::from_secs(30), Duration::from_secs(1));
        assert!(config.validate().is_err());
    }
}
