//! Node configuration

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::WorkerPoolConfig;
use crate::recovery::RecoveryConfig;
use crate::reliability::BackoffConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
}

/// Configuration of one dispatch node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Unique node ID (generated if not provided)
    pub node_id: String,

    /// Address other members use to reach this node
    pub address: String,

    /// Worker pool sizing and saturation policy
    pub pool: WorkerPoolConfig,

    /// Backoff of the queue sync loop when the queue is empty
    pub sync_backoff: BackoffConfig,

    /// Stale work recovery
    pub recovery: RecoveryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::now_v7()),
            address: "local".to_string(),
            pool: WorkerPoolConfig::default(),
            sync_backoff: BackoffConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Create configuration from environment variables
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TASKMESH_NODE_ID` | `node-<uuid v7>` |
    /// | `TASKMESH_ADDRESS` | `local` |
    /// | `TASKMESH_MIN_WORKERS` | `0` |
    /// | `TASKMESH_MAX_WORKERS` | `10` |
    /// | `TASKMESH_QUEUE_CAPACITY` | twice the max workers |
    /// | `TASKMESH_SATURATION_POLICY` | `reject` |
    /// | `TASKMESH_RECOVERY_ENABLED` | `true` |
    /// | `TASKMESH_EXPIRE_BUFFER_MS` | `5000` |
    /// | `TASKMESH_EMPTY_EXPIRE_BUFFER_MS` | `10000` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_workers = parse_var(&lookup, "TASKMESH_MAX_WORKERS")?
            .unwrap_or(defaults.pool.max_workers);
        let mut pool = WorkerPoolConfig::sized(max_workers);
        if let Some(min) = parse_var(&lookup, "TASKMESH_MIN_WORKERS")? {
            pool = pool.with_min_workers(min);
        }
        if let Some(capacity) = parse_var(&lookup, "TASKMESH_QUEUE_CAPACITY")? {
            pool = pool.with_queue_capacity(capacity);
        }
        if let Some(policy) = parse_var(&lookup, "TASKMESH_SATURATION_POLICY")? {
            pool = pool.with_saturation_policy(policy);
        }

        let mut recovery = defaults.recovery.clone();
        if let Some(enabled) = parse_var(&lookup, "TASKMESH_RECOVERY_ENABLED")? {
            recovery.enabled = enabled;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TASKMESH_EXPIRE_BUFFER_MS")? {
            recovery.expire_buffer = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TASKMESH_EMPTY_EXPIRE_BUFFER_MS")? {
            recovery.empty_expire_buffer = Duration::from_millis(ms);
        }

        Ok(Self {
            node_id: lookup("TASKMESH_NODE_ID").unwrap_or(defaults.node_id),
            address: lookup("TASKMESH_ADDRESS").unwrap_or(defaults.address),
            pool,
            sync_backoff: defaults.sync_backoff,
            recovery,
        })
    }

    /// Set the node ID
    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    /// Set the advertised address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the worker pool configuration
    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the sync loop backoff
    pub fn with_sync_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.sync_backoff = backoff;
        self
    }

    /// Set the recovery configuration
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        self.pool.validate()?;
        self.sync_backoff.validate()?;
        self.recovery.validate()
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
            reason: e.to_string(),
        })
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SaturationPolicy;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.pool.max_workers, 10);
        assert_eq!(config.sync_backoff.min_interval, Duration::from_millis(100));
        assert!(config.recovery.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = DispatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.pool, WorkerPoolConfig::default());
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert_eq!(config.address, "local");
    }

    #[test]
    fn test_environment_overrides() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("TASKMESH_NODE_ID", "node-a"),
            ("TASKMESH_MAX_WORKERS", "4"),
            ("TASKMESH_MIN_WORKERS", "1"),
            ("TASKMESH_SATURATION_POLICY", "caller_runs"),
            ("TASKMESH_RECOVERY_ENABLED", "false"),
            ("TASKMESH_EXPIRE_BUFFER_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.queue_capacity, 8);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.saturation_policy, SaturationPolicy::CallerRuns);
        assert!(!config.recovery.enabled);
        assert_eq!(config.recovery.expire_buffer, Duration::from_millis(250));
        assert_eq!(config.recovery.empty_expire_buffer, Duration::from_secs(10));
    }

    #[test]
    fn test_unparsable_value_is_reported() {
        let err = DispatchConfig::from_lookup(lookup(&[("TASKMESH_MAX_WORKERS", "lots")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnv { var, value, .. } => {
                assert_eq!(var, "TASKMESH_MAX_WORKERS");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_catches_nested_errors() {
        let config = DispatchConfig::default()
            .with_pool(WorkerPoolConfig::sized(2).with_min_workers(5));
        assert!(config.validate().is_err());

        let config = DispatchConfig::default().with_node_id("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = DispatchConfig::default().with_node_id("n1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["recovery"]["expire_buffer"], 5000);
        assert_eq!(json["pool"]["saturation_policy"], "reject");

        let parsed: DispatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
