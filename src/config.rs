//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::agent::AgentTimeouts;
use crate::disk::DiskAttachMode;
use crate::model::{UpdateConfig, UpdateStrategy};
use crate::orchestrator::Timings;
use crate::vm::RetryPolicy;

/// Orchestrator settings merged from defaults, configuration files and
/// `HOTSWAP_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HOTSWAP",
    discovery(
        app_name = "hotswap",
        env_var = "HOTSWAP_CONFIG_PATH",
        config_file_name = "hotswap.toml",
        dotfile_name = ".hotswap.toml",
        project_file_name = "hotswap.toml"
    )
)]
pub struct OrchestratorConfig {
    /// Update algorithm: `hot-swap` or `in-place`.
    #[ortho_config(default = "hot-swap".to_owned())]
    pub strategy: String,
    /// Upper bound on concurrently updating instances.
    #[ortho_config(default = 1)]
    pub max_in_flight: usize,
    /// Instances updated first to validate the rollout.
    #[ortho_config(default = 1)]
    pub canaries: usize,
    /// Health grace period for canaries, in milliseconds.
    #[ortho_config(default = 30_000)]
    pub canary_watch_time_ms: u64,
    /// Health grace period for the remaining instances, in milliseconds.
    #[ortho_config(default = 30_000)]
    pub update_watch_time_ms: u64,
    /// Pause between health polls, in milliseconds.
    #[ortho_config(default = 1_000)]
    pub health_poll_interval_ms: u64,
    /// Deadline for a single agent reply, in milliseconds.
    #[ortho_config(default = 45_000)]
    pub agent_timeout_ms: u64,
    /// Attempts per agent command when replies time out.
    #[ortho_config(default = 3)]
    pub agent_attempts: u32,
    /// Attempts per VM creation on transient provider errors.
    #[ortho_config(default = 3)]
    pub create_attempts: u32,
    /// Attempts per VM deletion before the VM is reported as orphaned.
    #[ortho_config(default = 10)]
    pub delete_attempts: u32,
    /// Pause between retried provider and agent calls, in milliseconds.
    #[ortho_config(default = 2_000)]
    pub retry_backoff_ms: u64,
    /// How disks change hands: `serialized`, `concurrent` or `provider`.
    #[ortho_config(default = "provider".to_owned())]
    pub disk_attach_mode: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn invalid(&self, problem: &str) -> ConfigError {
        ConfigError::InvalidField(format!(
            "{} {problem}: set {} or {} in hotswap.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const STRATEGY: FieldMetadata = FieldMetadata::new("update strategy", "HOTSWAP_STRATEGY", "strategy");
const MAX_IN_FLIGHT: FieldMetadata =
    FieldMetadata::new("max in flight", "HOTSWAP_MAX_IN_FLIGHT", "max_in_flight");
const HEALTH_POLL: FieldMetadata = FieldMetadata::new(
    "health poll interval",
    "HOTSWAP_HEALTH_POLL_INTERVAL_MS",
    "health_poll_interval_ms",
);
const AGENT_TIMEOUT: FieldMetadata =
    FieldMetadata::new("agent timeout", "HOTSWAP_AGENT_TIMEOUT_MS", "agent_timeout_ms");
const CANARY_WATCH: FieldMetadata = FieldMetadata::new(
    "canary watch time",
    "HOTSWAP_CANARY_WATCH_TIME_MS",
    "canary_watch_time_ms",
);
const UPDATE_WATCH: FieldMetadata = FieldMetadata::new(
    "update watch time",
    "HOTSWAP_UPDATE_WATCH_TIME_MS",
    "update_watch_time_ms",
);
const DISK_ATTACH_MODE: FieldMetadata =
    FieldMetadata::new("disk attach mode", "HOTSWAP_DISK_ATTACH_MODE", "disk_attach_mode");

impl OrchestratorConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hotswap")]).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.invalid("must be greater than zero"));
        }
        Ok(())
    }

    /// Parsed update strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for unknown names.
    pub fn parsed_strategy(&self) -> Result<UpdateStrategy, ConfigError> {
        self.strategy
            .parse()
            .map_err(|err: crate::model::UnknownStrategy| STRATEGY.invalid(&err.to_string()))
    }

    /// Parsed disk attach mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for unknown names.
    pub fn parsed_disk_attach_mode(&self) -> Result<DiskAttachMode, ConfigError> {
        self.disk_attach_mode
            .parse()
            .map_err(|err: crate::disk::UnknownAttachMode| DISK_ATTACH_MODE.invalid(&err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that set the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_strategy()?;
        self.parsed_disk_attach_mode()?;
        if self.max_in_flight == 0 {
            return Err(MAX_IN_FLIGHT.invalid("must be at least 1"));
        }
        Self::require_positive(self.health_poll_interval_ms, &HEALTH_POLL)?;
        Self::require_positive(self.agent_timeout_ms, &AGENT_TIMEOUT)?;
        Self::require_positive(self.canary_watch_time_ms, &CANARY_WATCH)?;
        Self::require_positive(self.update_watch_time_ms, &UPDATE_WATCH)?;
        Ok(())
    }

    /// Builds the update configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_update_config(&self) -> Result<UpdateConfig, ConfigError> {
        self.validate()?;
        let max_in_flight =
            NonZeroUsize::new(self.max_in_flight).ok_or_else(|| MAX_IN_FLIGHT.invalid("must be at least 1"))?;
        Ok(UpdateConfig {
            strategy: self.parsed_strategy()?,
            ..UpdateConfig::hot_swap(max_in_flight)
        }
        .with_canaries(self.canaries)
        .with_watch_times(
            Duration::from_millis(self.canary_watch_time_ms),
            Duration::from_millis(self.update_watch_time_ms),
        ))
    }

    /// Builds the timeouts, retry budgets and disk strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn timings(&self) -> Result<Timings, ConfigError> {
        self.validate()?;
        let backoff = Duration::from_millis(self.retry_backoff_ms);
        Ok(Timings {
            health_poll_interval: Duration::from_millis(self.health_poll_interval_ms),
            agent: AgentTimeouts {
                reply: Duration::from_millis(self.agent_timeout_ms),
                attempts: self.agent_attempts.max(1),
                backoff,
            },
            create: RetryPolicy::new(self.create_attempts, backoff),
            delete: RetryPolicy::new(self.delete_attempts, backoff),
            disk_attach_mode: self.parsed_disk_attach_mode()?,
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configuration value is out of range or unrecognised.
    #[error("invalid configuration: {0}")]
    InvalidField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
