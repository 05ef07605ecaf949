//! Core configuration. Every field has a default so a partial (or empty) file is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_TIMEOUT_MS, POLL_INTERVAL_MS};
use crate::registry::ChannelKind;

/// Default transfer chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default bound on queued transfer jobs.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default cap on channels simultaneously occupied by transfers.
pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Consecutive send failures tolerated before a channel is demoted to ERROR.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Default wait for an inbound event.
pub const DEFAULT_EVENT_TIMEOUT_MS: u32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub link: LinkConfig,
    pub scheduler: SchedulerConfig,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Overall ack (and response) deadline for `send_command`.
    pub command_timeout_ms: u32,
    pub event_timeout_ms: u32,
    /// Sub-timeout for each transport poll while waiting.
    pub poll_interval_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            event_timeout_ms: DEFAULT_EVENT_TIMEOUT_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub parallel: bool,
    pub max_parallel: usize,
    pub chunk_size: usize,
    pub queue_capacity: usize,
    /// Channels the scheduler never assigns. Keyboard and mouse are too slow for bulk transfer.
    pub disabled_channels: Vec<ChannelKind>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            max_parallel: DEFAULT_MAX_PARALLEL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            disabled_channels: vec![ChannelKind::Keyboard, ChannelKind::Mouse],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelsConfig {
    pub error_threshold: u32,
    /// Per-channel rating overrides applied on top of the built-in profiles.
    pub overrides: BTreeMap<ChannelKind, ChannelOverride>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelOverride {
    pub priority: Option<u8>,
    pub speed_kbps: Option<u32>,
    pub stealth: Option<u8>,
    pub reliability: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("scheduler.chunk_size must be non-zero")]
    ZeroChunkSize,
    #[error("scheduler.chunk_size {0} does not fit the u32 session header")]
    ChunkSizeTooLarge(usize),
    #[error("scheduler.queue_capacity must be non-zero")]
    ZeroQueueCapacity,
    #[error("scheduler.max_parallel must be non-zero when parallel mode is on")]
    ZeroParallel,
    #[error("link.poll_interval_ms must be non-zero")]
    ZeroPollInterval,
    #[error("channel {0:?}: priority must be at least 1")]
    ZeroPriority(ChannelKind),
}

impl LinkConfig {
    /// A zero poll interval would turn every wait into a busy loop that never reads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if u32::try_from(s.chunk_size).is_err() {
            return Err(ConfigError::ChunkSizeTooLarge(s.chunk_size));
        }
        if s.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if s.parallel && s.max_parallel == 0 {
            return Err(ConfigError::ZeroParallel);
        }
        self.link.validate()?;
        for (kind, o) in &self.channels.overrides {
            if o.priority == Some(0) {
                return Err(ConfigError::ZeroPriority(*kind));
            }
        }
        Ok(())
    }
}
