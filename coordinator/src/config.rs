//! Coordinator configuration.

use std::time::Duration;

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease granted per acquisition.
    pub lease_duration: Duration,
    /// Retries for a conflicted multi-account acquisition.
    pub acquire_retries: u32,
    /// Base backoff between retries; grows linearly with jitter.
    pub retry_backoff: Duration,
    /// Expired-lock cleanup interval.
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            acquire_retries: 3,
            retry_backoff: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// Consensus configuration.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Nodes selected from the ring per transaction.
    pub replication: usize,
    /// Deadline for each validator; a miss counts as a reject.
    pub validation_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            replication: 3,
            validation_timeout: Duration::from_millis(500),
        }
    }
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// Non-terminal records older than this are re-evaluated.
    pub stale_horizon: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_horizon: Duration::from_secs(120),
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Node ID for this coordinator instance (generated when absent).
    pub node_id: Option<String>,
    /// Lock configuration.
    pub lock: LockConfig,
    /// Consensus configuration.
    pub consensus: ConsensusConfig,
    /// Reconciliation configuration.
    pub reconciler: ReconcilerConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            lock: LockConfig::default(),
            consensus: ConsensusConfig::default(),
            reconciler: ReconcilerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("NODE_ID") {
            config.node_id = Some(id);
        }

        if let Ok(replication) = std::env::var("VALIDATION_REPLICATION") {
            if let Ok(replication) = replication.parse() {
                config.consensus.replication = replication;
            }
        }

        if let Ok(ms) = std::env::var("VALIDATION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.consensus.validation_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(secs) = std::env::var("LOCK_LEASE_SECS") {
            if let Ok(secs) = secs.parse() {
                config.lock.lease_duration = Duration::from_secs(secs);
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.consensus.replication == 0 {
            return Err("Replication cannot be 0".to_string());
        }
        if self.lock.lease_duration.is_zero() {
            return Err("Lock lease duration cannot be zero".to_string());
        }
        if self.consensus.validation_timeout.is_zero() {
            return Err("Validation timeout cannot be zero".to_string());
        }
        if self.reconciler.stale_horizon < self.lock.lease_duration {
            return Err(
                "Reconciler horizon must be at least one lock lease interval".to_string(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.consensus.replication = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.reconciler.stale_horizon = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
