//! Configuration management for rabia-consensus
//!
//! This module provides the configuration system for a consensus node,
//! including builder construction, TOML files, environment variable
//! overrides and validation. Invalid values are rejected when the
//! configuration is built, never at runtime.
//!
//! # Examples
//!
//! ```rust,no_run
//! use rabia_consensus::config::{Config, ConfigBuilder};
//! use std::time::Duration;
//!
//! let config = ConfigBuilder::new()
//!     .node_id(1)
//!     .data_dir("./data")
//!     .add_member(1, "127.0.0.1:7001")
//!     .add_member(2, "127.0.0.1:7002")
//!     .add_member(3, "127.0.0.1:7003")
//!     .reconciliation_interval(Duration::from_secs(2))
//!     .build()
//!     .expect("Failed to build config");
//!
//! // Loading from environment (requires RABIA_NODE_ID to be set)
//! // let config = Config::from_env().expect("Failed to load config from environment");
//!
//! // Loading from file (requires rabia.toml to exist)
//! // let config = Config::from_file("rabia.toml").expect("Failed to load config from file");
//! ```

use crate::topology::backoff::BackoffConfig;
use crate::types::{NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration field value
    #[error("Invalid configuration: {field}: {message}")]
    Invalid {
        /// The field that has invalid configuration
        field: String,
        /// Description of what makes it invalid
        message: String,
    },

    /// Required configuration field is missing
    #[error("Missing required field: {field}")]
    Missing {
        /// The name of the missing field
        field: String,
    },

    /// IO error occurred while reading/writing configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    /// Environment variable processing error
    #[error("Environment variable error: {0}")]
    Environment(String),
}

/// Complete configuration for a consensus node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and membership
    pub node: NodeConfig,

    /// Phase engine tuning
    pub protocol: ProtocolConfig,

    /// Membership health tracking
    pub topology: TopologyConfig,

    /// Checkpoint persistence
    pub storage: StorageConfig,

    /// Logging
    pub observability: ObservabilityConfig,
}

/// Node identity and initial cluster membership
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier (required)
    pub id: Option<NodeId>,

    /// Data directory for persistent storage
    pub data_dir: PathBuf,

    /// Every cluster member, including this node
    pub members: Vec<NodeInfo>,
}

/// Immutable tuning of the phase engine
///
/// The first three values are the mandatory knobs of the protocol; the rest
/// bound memory and retransmission. Use [`ProtocolConfig::new`] to build one
/// with validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    #[serde(with = "humantime_serde")]
    cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    sync_retry_interval: Duration,
    remove_older_than_phases: u64,
    #[serde(with = "humantime_serde")]
    retransmit_interval: Duration,
    #[serde(with = "humantime_serde")]
    max_retransmit_interval: Duration,
    #[serde(with = "humantime_serde")]
    tick_interval: Duration,
    max_phase_iterations: u32,
    max_pending_batches: usize,
    max_tracked_phases: usize,
    max_tracked_correlations: usize,
    committed_history_size: usize,
    phase_lookahead: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(1),
            sync_retry_interval: Duration::from_millis(500),
            remove_older_than_phases: 100,
            retransmit_interval: Duration::from_millis(50),
            max_retransmit_interval: Duration::from_millis(400),
            tick_interval: Duration::from_millis(10),
            max_phase_iterations: 16,
            max_pending_batches: 10_000,
            max_tracked_phases: 1024,
            max_tracked_correlations: 10_000,
            committed_history_size: 8192,
            phase_lookahead: 64,
        }
    }
}

impl ProtocolConfig {
    /// Build a protocol configuration; every value must be positive
    pub fn new(
        cleanup_interval: Duration,
        sync_retry_interval: Duration,
        remove_older_than_phases: u64,
    ) -> ConfigResult<Self> {
        let config = Self {
            cleanup_interval,
            sync_retry_interval,
            remove_older_than_phases,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the retransmission schedule
    pub fn with_retransmit(mut self, initial: Duration, max: Duration) -> Self {
        self.retransmit_interval = initial;
        self.max_retransmit_interval = max;
        self
    }

    /// Replace the stalled-phase alarm threshold
    pub fn with_max_phase_iterations(mut self, iterations: u32) -> Self {
        self.max_phase_iterations = iterations;
        self
    }

    /// Replace the capacity limits of the bounded bookkeeping
    pub fn with_capacities(
        mut self,
        max_pending_batches: usize,
        max_tracked_phases: usize,
        max_tracked_correlations: usize,
        committed_history_size: usize,
    ) -> Self {
        self.max_pending_batches = max_pending_batches;
        self.max_tracked_phases = max_tracked_phases;
        self.max_tracked_correlations = max_tracked_correlations;
        self.committed_history_size = committed_history_size;
        self
    }

    /// Replace the engine tick used by the async node runtime
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    /// How often stale per-phase state is purged
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// How often a lagging node re-requests snapshots
    pub fn sync_retry_interval(&self) -> Duration {
        self.sync_retry_interval
    }

    /// Retention window, in completed phases
    pub fn remove_older_than_phases(&self) -> u64 {
        self.remove_older_than_phases
    }

    /// First retransmission delay for a phase without progress
    pub fn retransmit_interval(&self) -> Duration {
        self.retransmit_interval
    }

    /// Cap of the doubling retransmission delay
    pub fn max_retransmit_interval(&self) -> Duration {
        self.max_retransmit_interval
    }

    /// Engine tick of the async runtime
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Iterations after which a phase is reported as stalled
    pub fn max_phase_iterations(&self) -> u32 {
        self.max_phase_iterations
    }

    /// Capacity of the pending-batch queue
    pub fn max_pending_batches(&self) -> usize {
        self.max_pending_batches
    }

    /// Capacity of the per-phase bookkeeping
    pub fn max_tracked_phases(&self) -> usize {
        self.max_tracked_phases
    }

    /// Capacity of the proposer correlation tracker
    pub fn max_tracked_correlations(&self) -> usize {
        self.max_tracked_correlations
    }

    /// Capacity of the committed-batch history used for dedup
    pub fn committed_history_size(&self) -> usize {
        self.committed_history_size
    }

    /// How many phases ahead of the local one are buffered
    pub fn phase_lookahead(&self) -> u64 {
        self.phase_lookahead
    }

    /// Validate all values
    pub fn validate(&self) -> ConfigResult<()> {
        let positive_durations = [
            ("protocol.cleanup_interval", self.cleanup_interval),
            ("protocol.sync_retry_interval", self.sync_retry_interval),
            ("protocol.retransmit_interval", self.retransmit_interval),
            ("protocol.tick_interval", self.tick_interval),
        ];
        for (field, value) in positive_durations {
            if value.is_zero() {
                return Err(invalid(field, "Interval must be positive"));
            }
        }

        let positive_counts = [
            ("protocol.remove_older_than_phases", self.remove_older_than_phases),
            ("protocol.max_phase_iterations", u64::from(self.max_phase_iterations)),
            ("protocol.max_pending_batches", self.max_pending_batches as u64),
            ("protocol.max_tracked_correlations", self.max_tracked_correlations as u64),
            ("protocol.committed_history_size", self.committed_history_size as u64),
            ("protocol.phase_lookahead", self.phase_lookahead),
        ];
        for (field, value) in positive_counts {
            if value == 0 {
                return Err(invalid(field, "Value must be positive"));
            }
        }

        if self.max_retransmit_interval < self.retransmit_interval {
            return Err(invalid(
                "protocol.max_retransmit_interval",
                "Must not be below retransmit_interval",
            ));
        }

        let window = self.remove_older_than_phases + self.phase_lookahead;
        if (self.max_tracked_phases as u64) <= window {
            return Err(invalid(
                "protocol.max_tracked_phases",
                "Must exceed remove_older_than_phases + phase_lookahead",
            ));
        }
        Ok(())
    }
}

/// Membership health tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// How often connected peers are reconciled against membership
    #[serde(with = "humantime_serde")]
    pub reconciliation_interval: Duration,

    /// Reconnection backoff
    pub backoff: BackoffConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: StorageBackend,

    /// Database file name inside `node.data_dir`
    pub file_name: String,
}

/// Storage backend options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Embedded redb database (default)
    #[default]
    Redb,

    /// In-memory storage (for testing)
    Memory,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output (default)
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: PathBuf::from("./data"),
            members: Vec::new(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            reconciliation_interval: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Redb,
            file_name: "rabia.redb".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn env_number<T: FromStr>(name: &str, what: &str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Environment(format!("Invalid {what}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RABIA_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Some(id) = env_number::<u64>("RABIA_NODE_ID", "node ID")? {
            self.node.id = Some(NodeId::new(id));
        }

        if let Ok(data_dir) = std::env::var("RABIA_DATA_DIR") {
            self.node.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(members) = std::env::var("RABIA_MEMBERS") {
            self.node.members = members
                .split(',')
                .filter(|m| !m.trim().is_empty())
                .map(|m| m.trim().parse::<NodeInfo>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(ConfigError::Environment)?;
        }

        if let Some(ms) = env_number::<u64>("RABIA_CLEANUP_INTERVAL_MS", "cleanup interval")? {
            self.protocol.cleanup_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env_number::<u64>("RABIA_SYNC_RETRY_INTERVAL_MS", "sync retry interval")? {
            self.protocol.sync_retry_interval = Duration::from_millis(ms);
        }

        if let Some(phases) =
            env_number::<u64>("RABIA_REMOVE_OLDER_THAN_PHASES", "retention window")?
        {
            self.protocol.remove_older_than_phases = phases;
        }

        if let Ok(log_level) = std::env::var("RABIA_LOG_LEVEL") {
            self.observability.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let node_id = self.node.id.ok_or_else(|| ConfigError::Missing {
            field: "node.id".to_string(),
        })?;

        if self.node.data_dir.as_os_str().is_empty() {
            return Err(invalid("node.data_dir", "Data directory cannot be empty"));
        }

        let mut seen = HashSet::new();
        for member in &self.node.members {
            if !seen.insert(member.id) {
                return Err(ConfigError::Invalid {
                    field: "node.members".to_string(),
                    message: format!("Duplicate member id: {}", member.id),
                });
            }
        }
        if !self.node.members.is_empty() && !seen.contains(&node_id) {
            return Err(ConfigError::Invalid {
                field: "node.members".to_string(),
                message: format!("Local node {node_id} is not listed as a member"),
            });
        }

        self.protocol.validate()?;
        self.topology.backoff.validate()?;

        if self.topology.reconciliation_interval.is_zero() {
            return Err(invalid(
                "topology.reconciliation_interval",
                "Interval must be positive",
            ));
        }

        if self.storage.file_name.is_empty() {
            return Err(invalid("storage.file_name", "File name cannot be empty"));
        }

        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Invalid {
                    field: "observability.logging.level".to_string(),
                    message: format!("Invalid log level: {other}"),
                });
            }
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Environment(format!("Serialization failed: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Membership as a sorted, de-duplicated id list
    pub fn member_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.node.members.iter().map(|m| m.id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Configuration builder for fluent API construction
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the node ID
    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.node.id = Some(id.into());
        self
    }

    /// Set the data directory
    pub fn data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.node.data_dir = dir.into();
        self
    }

    /// Add a cluster member
    pub fn add_member(mut self, id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        self.config.node.members.push(NodeInfo::new(id, address));
        self
    }

    /// Replace the member list
    pub fn members(mut self, members: Vec<NodeInfo>) -> Self {
        self.config.node.members = members;
        self
    }

    /// Set the phase engine tuning
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Set reconnection backoff
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.topology.backoff = backoff;
        self
    }

    /// Set the topology reconciliation interval
    pub fn reconciliation_interval(mut self, interval: Duration) -> Self {
        self.config.topology.reconciliation_interval = interval;
        self
    }

    /// Set storage backend
    pub fn storage_backend(mut self, backend: StorageBackend) -> Self {
        self.config.storage.backend = backend;
        self
    }

    /// Set log level
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.observability.logging.level = level.into();
        self
    }

    /// Set log format
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.observability.logging.format = format;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ConfigResult<Config> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation (useful for testing)
    pub fn build_unchecked(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redb" => Ok(StorageBackend::Redb),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(ConfigError::Invalid {
                field: "storage.backend".to_string(),
                message: format!("Invalid storage backend: {s}"),
            }),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid {
                field: "observability.logging.format".to_string(),
                message: format!("Invalid log format: {s}"),
            }),
        }
    }
}
