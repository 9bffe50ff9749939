//! Provisioning configuration.
//!
//! Configuration lives in /etc/provision/config.toml. Every field has a
//! default, so a missing file or a partial file is fine. Out-of-range values
//! are clamped by the `effective_*` accessors rather than rejected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::copy::{DEFAULT_CHUNK_SIZE, DIRECT_IO_ALIGNMENT, MAX_CHUNK_SIZE};

/// System configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/provision";
const CONFIG_FILE: &str = "config.toml";

/// Get the default config file path
pub fn config_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE)
}

// ============================================================================
// Flash
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Copy buffer size in bytes (valid: 4 KiB - 64 MiB, multiple of 4 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Seconds between aggregate progress lines (valid: 1-60)
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Open partitions with O_DIRECT
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_progress_interval() -> u64 {
    1
}

fn default_direct_io() -> bool {
    true
}

impl FlashConfig {
    pub fn effective_chunk_size(&self) -> usize {
        let size = self.chunk_size_bytes.clamp(DIRECT_IO_ALIGNMENT, MAX_CHUNK_SIZE);
        size - size % DIRECT_IO_ALIGNMENT
    }

    pub fn effective_progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.clamp(1, 60))
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            progress_interval_secs: default_progress_interval(),
            direct_io: default_direct_io(),
        }
    }
}

// ============================================================================
// Reconnect
// ============================================================================

/// How to wait for a DUT to come back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect attempts before giving up (valid: 1-100)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Timeout of one attempt, seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Pause between attempts, seconds
    #[serde(default = "default_pause")]
    pub pause_secs: u64,

    /// Wait after a servo reset when the DUT has no SSH connection, seconds
    #[serde(default = "default_servo_reboot_wait")]
    pub servo_reboot_wait_secs: u64,
}

fn default_retries() -> u32 {
    10
}

fn default_attempt_timeout() -> u64 {
    10
}

fn default_pause() -> u64 {
    10
}

fn default_servo_reboot_wait() -> u64 {
    30
}

impl ReconnectConfig {
    pub fn effective_retries(&self) -> u32 {
        self.retries.clamp(1, 100)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn servo_reboot_wait(&self) -> Duration {
        Duration::from_secs(self.servo_reboot_wait_secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            attempt_timeout_secs: default_attempt_timeout(),
            pause_secs: default_pause(),
            servo_reboot_wait_secs: default_servo_reboot_wait(),
        }
    }
}

// ============================================================================
// Deadline, servo, log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Bound on one provisioning attempt, seconds (valid: 60-86400)
    #[serde(default = "default_deadline")]
    pub overall_secs: u64,
}

fn default_deadline() -> u64 {
    3600
}

impl DeadlineConfig {
    pub fn overall(&self) -> Duration {
        Duration::from_secs(self.overall_secs.clamp(60, 86_400))
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            overall_secs: default_deadline(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoConfigSection {
    /// servod port on the servo host
    #[serde(default = "default_servo_port")]
    pub port: u16,
}

fn default_servo_port() -> u16 {
    9999
}

impl Default for ServoConfigSection {
    fn default() -> Self {
        Self {
            port: default_servo_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing filter, e.g. "info" or "provision_common=debug"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub flash: FlashConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub deadline: DeadlineConfig,

    #[serde(default)]
    pub servo: ServoConfigSection,

    #[serde(default)]
    pub log: LogConfig,
}

impl ProvisionConfig {
    /// Load from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load from the system path.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
