//! Configuration system for the tile session
//!
//! A hierarchical configuration that lets callers pick a preset through
//! [`LoaderProfile`] or tune every knob of [`SessionConfig`] directly. The
//! config is serde-serializable so it can be kept next to the disk cache as
//! JSON; missing fields fall back to the balanced defaults.

use crate::core::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_EVENT_CAPACITY, DEFAULT_FAILURE_LEDGER_CAPACITY,
    DEFAULT_LEVELS_KEEP_IN_MEMORY,
};
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderProfile {
    Balanced,
    LowResource,
    HighPerformance,
    Custom(SessionConfig),
}

impl LoaderProfile {
    pub fn resolve(&self) -> SessionConfig {
        match self {
            Self::Balanced => SessionConfig::default(),
            Self::LowResource => SessionConfig {
                concurrency: 2,
                retry_cap: 1,
                retry_delay_ms: 1000,
                max_retry_delay_ms: 4000,
                backoff: Backoff::Fixed,
                levels_keep_in_memory: 2,
                max_fallback_levels: 2,
                failure_ledger_capacity: 512,
                event_capacity: 256,
                ..SessionConfig::default()
            },
            Self::HighPerformance => SessionConfig {
                concurrency: 8,
                retry_cap: 3,
                retry_delay_ms: 250,
                max_retry_delay_ms: 2000,
                backoff: Backoff::Linear,
                levels_keep_in_memory: 8,
                max_fallback_levels: 8,
                failure_ledger_capacity: 16_384,
                ..SessionConfig::default()
            },
            Self::Custom(config) => config.clone(),
        }
    }
}

impl Default for LoaderProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Delay curve between retries of a transiently failing tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay grows with the attempt number
    Linear,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), capped at `max`
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let delay = match self {
            Self::Fixed => base,
            Self::Linear => base.saturating_mul(attempt.max(1)),
        };
        delay.min(max)
    }
}

/// Which tile sources a session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Disk store first, then the network; network results are written through
    ServerAndCache,
    /// Network only, the disk store is neither read nor written
    ServerOnly,
    /// Disk store only, never touches the network
    CacheOnly,
}

impl AccessMode {
    pub fn reads_store(&self) -> bool {
        matches!(self, Self::ServerAndCache | Self::CacheOnly)
    }

    pub fn writes_store(&self) -> bool {
        matches!(self, Self::ServerAndCache)
    }

    pub fn uses_network(&self) -> bool {
        matches!(self, Self::ServerAndCache | Self::ServerOnly)
    }
}

/// RGBA color
pub type Rgba = [u8; 4];

/// How a tile that failed to load is painted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderStyle {
    pub fill: Rgba,
    pub border: Rgba,
    pub border_width: f32,
    pub text: String,
    pub show_error_text: bool,
}

impl Default for PlaceholderStyle {
    fn default() -> Self {
        Self {
            // navy fill, white stroke
            fill: [0, 0, 128, 255],
            border: [255, 255, 255, 255],
            border_width: 1.0,
            text: "We are sorry, but we don't\nhave imagery at this zoom\nlevel for this region."
                .to_string(),
            show_error_text: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum concurrent tile fetches
    pub concurrency: usize,
    /// Retries after the first failed attempt before a failure turns terminal
    pub retry_cap: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff: Backoff,
    /// Timeout applied around every provider call
    pub fetch_timeout_ms: u64,
    /// Zoom levels kept decoded on each side of the active one
    pub levels_keep_in_memory: u8,
    /// How many ancestor levels are searched for a fallback image
    pub max_fallback_levels: u8,
    pub fill_empty_tiles: bool,
    pub failure_ledger_capacity: usize,
    /// Extra pixels added around the viewport when enumerating visible tiles
    pub viewport_margin_px: i64,
    pub access_mode: AccessMode,
    pub placeholder: PlaceholderStyle,
    /// Undelivered events kept for the consumer before new ones are dropped
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_cap: 2,
            retry_delay_ms: 500,
            max_retry_delay_ms: 3000,
            backoff: Backoff::Linear,
            fetch_timeout_ms: 10_000,
            levels_keep_in_memory: DEFAULT_LEVELS_KEEP_IN_MEMORY,
            max_fallback_levels: DEFAULT_LEVELS_KEEP_IN_MEMORY,
            fill_empty_tiles: true,
            failure_ledger_capacity: DEFAULT_FAILURE_LEDGER_CAPACITY,
            viewport_margin_px: 64,
            access_mode: AccessMode::ServerAndCache,
            placeholder: PlaceholderStyle::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            concurrency: 2,
            retry_cap: 2,
            retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            backoff: Backoff::Fixed,
            fetch_timeout_ms: 2000,
            ..Self::default()
        }
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(
            attempt,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(MapError::Config("concurrency must be at least 1".into()));
        }
        if self.failure_ledger_capacity == 0 {
            return Err(MapError::Config(
                "failure_ledger_capacity must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(MapError::Config("event_capacity must be at least 1".into()));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(MapError::Config(format!(
                "max_retry_delay_ms ({}) is below retry_delay_ms ({})",
                self.max_retry_delay_ms, self.retry_delay_ms
            )));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(MapError::Config("fetch_timeout_ms must be positive".into()));
        }
        if self.viewport_margin_px < 0 {
            return Err(MapError::Config("viewport_margin_px cannot be negative".into()));
        }
        Ok(())
    }

    /// Parse a JSON document; unknown fields are ignored, missing ones defaulted
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
