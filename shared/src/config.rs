use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::ids::Username;

pub const DEFAULT_UNBOX_BATCH_SIZE: usize = 10;
pub const DEFAULT_UNBOX_DRAIN_DELAY_MS: u64 = 100;
pub const DEFAULT_INITIAL_LOAD_COUNT: u32 = 50;
pub const DEFAULT_SCROLLBACK_LOAD_COUNT: u32 = 50;
pub const DEFAULT_UPLOAD_PROGRESS_STEP: f32 = 0.05;
pub const DEFAULT_RESOLVED_OUTBOX_MEMORY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub username: Option<Username>,
    pub unbox_batch_size: usize,
    pub unbox_drain_delay_ms: u64,
    pub initial_load_count: u32,
    pub scrollback_load_count: u32,
    pub upload_progress_step: f32,
    pub resolved_outbox_memory: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            username: None,
            unbox_batch_size: DEFAULT_UNBOX_BATCH_SIZE,
            unbox_drain_delay_ms: DEFAULT_UNBOX_DRAIN_DELAY_MS,
            initial_load_count: DEFAULT_INITIAL_LOAD_COUNT,
            scrollback_load_count: DEFAULT_SCROLLBACK_LOAD_COUNT,
            upload_progress_step: DEFAULT_UPLOAD_PROGRESS_STEP,
            resolved_outbox_memory: DEFAULT_RESOLVED_OUTBOX_MEMORY,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a config delivered by the shell as JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unbox_batch_size == 0 {
            return Err(ConfigError::Invalid("unbox_batch_size must be > 0".into()));
        }
        if self.initial_load_count == 0 || self.scrollback_load_count == 0 {
            return Err(ConfigError::Invalid("load counts must be > 0".into()));
        }
        if !(self.upload_progress_step > 0.0 && self.upload_progress_step < 1.0) {
            return Err(ConfigError::Invalid(
                "upload_progress_step must be in (0, 1)".into(),
            ));
        }
        if self.resolved_outbox_memory == 0 {
            return Err(ConfigError::Invalid(
                "resolved_outbox_memory must be > 0".into(),
            ));
        }
        if self.username.as_ref().is_some_and(|u| u.as_str().is_empty()) {
            return Err(ConfigError::Invalid("username cannot be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn unbox_drain_delay(&self) -> Duration {
        Duration::from_millis(self.unbox_drain_delay_ms)
    }
}
