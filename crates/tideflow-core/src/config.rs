//! Engine configuration
//!
//! Values come from built-in defaults, an optional config file and
//! `TIDEFLOW_*` environment variables, in that order of precedence.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Tunables for the execution loop and the instance dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on loop steps within a single trigger
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// Upper bound on scope completion sweeps within a single trigger
    #[serde(default = "default_max_scope_sweep_iterations")]
    pub max_scope_sweep_iterations: usize,

    /// Re-fire period handed to the timer scheduler until a timer is cancelled
    #[serde(default = "default_timer_guard_period_secs")]
    pub timer_guard_period_secs: u64,

    /// Upper bound on the iterations one multi-instance activity may spawn
    #[serde(default = "default_max_multi_instance_iterations")]
    pub max_multi_instance_iterations: usize,

    /// Capacity of each instance's work queue
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_max_loop_iterations() -> usize {
    10_000
}

fn default_max_scope_sweep_iterations() -> usize {
    1_000
}

fn default_timer_guard_period_secs() -> u64 {
    60
}

fn default_max_multi_instance_iterations() -> usize {
    10_000
}

fn default_mailbox_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_scope_sweep_iterations: default_max_scope_sweep_iterations(),
            timer_guard_period_secs: default_timer_guard_period_secs(),
            max_multi_instance_iterations: default_max_multi_instance_iterations(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, CoreError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TIDEFLOW"));

        let loaded: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoreError::ConfigurationError(format!("Invalid engine config: {}", e)))?;
        loaded.validate()?;

        info!(
            max_loop_iterations = loaded.max_loop_iterations,
            max_scope_sweep_iterations = loaded.max_scope_sweep_iterations,
            mailbox_capacity = loaded.mailbox_capacity,
            "Engine configuration loaded"
        );
        Ok(loaded)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_loop_iterations == 0 {
            return Err(CoreError::ConfigurationError(
                "max_loop_iterations must be greater than zero".to_string(),
            ));
        }
        if self.max_scope_sweep_iterations == 0 {
            return Err(CoreError::ConfigurationError(
                "max_scope_sweep_iterations must be greater than zero".to_string(),
            ));
        }
        if self.max_multi_instance_iterations == 0 {
            return Err(CoreError::ConfigurationError(
                "max_multi_instance_iterations must be greater than zero".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "mailbox_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Timer guard period as a duration
    pub fn timer_guard_period(&self) -> Duration {
        Duration::from_secs(self.timer_guard_period_secs)
    }
}
