//! Engine configuration.
//!
//! Loaded from a TOML file when one exists, otherwise defaults apply.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Copy-worker tuning: size tiers and chunk sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Files at or below this size are copied in one synchronous call.
    pub small_file_threshold: u64,
    /// Chunk size for the progress-reporting copy tier.
    pub chunk_size: usize,
    /// Files above this size use the incremental tier with larger chunks.
    pub huge_file_threshold: u64,
    /// Chunk size for the incremental copy tier.
    pub huge_chunk_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 4 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            huge_file_threshold: 256 * 1024 * 1024,
            huge_chunk_size: 8 * 1024 * 1024,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Event bus broadcast capacity.
    pub event_capacity: usize,
    /// Scheduler command channel capacity.
    pub command_capacity: usize,
    /// Sleep interval for paused workers polling `can_continue`.
    pub pause_poll_interval_ms: u64,
    pub copy: CopyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            command_capacity: 64,
            pause_poll_interval_ms: 200,
            copy: CopyConfig::default(),
        }
    }
}

/// Load configuration from `path`, or fall back to defaults when no path is
/// given or the file does not exist.
pub fn load_config_or_default(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    if !path.exists() {
        tracing::info!(path = %path.display(), "No config file found, using defaults");
        return Ok(EngineConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
