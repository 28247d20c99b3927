//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SIM7600_PORT`, `SIM7600_BAUD`,
//!    `SIMCOMD_LOG`
//! 2. **Config file**: path via `--config <path>`, or `simcomd.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB2"   # omit to auto-detect
//! baud_rate = 115200
//!
//! [timeouts]
//! status_ms = 3000
//! gps_ms = 10000
//! sms_ms = 5000
//! sms_send_ms = 30000
//!
//! [gps]
//! retries = 3
//! settle_delay_ms = 2000
//!
//! [poll]
//! interval_ms = 100
//!
//! [sms]
//! storage = "SM"
//! text_mode = true
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::gps::GpsTimeouts;
use crate::sms::SmsTimeouts;
use crate::util::expand_tilde;

const DEFAULT_FILE: &str = "simcomd.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path. `None` means auto-detect. Override with `SIM7600_PORT`.
    #[serde(default)]
    pub device: Option<String>,
    /// Line speed (default 115200). Override with `SIM7600_BAUD`.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Per-exchange deadlines in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Setup and status queries (default 3000).
    #[serde(default = "default_status_ms")]
    pub status_ms: u64,
    /// GPS start/stop/fix (default 10 000).
    #[serde(default = "default_gps_ms")]
    pub gps_ms: u64,
    /// SMS listing, delete, and the send prompt (default 5000).
    #[serde(default = "default_sms_ms")]
    pub sms_ms: u64,
    /// Network confirmation of a sent SMS (default 30 000).
    #[serde(default = "default_sms_send_ms")]
    pub sms_send_ms: u64,
}

/// GPS fix acquisition.
#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    /// Fix attempts before giving up (default 3).
    #[serde(default = "default_gps_retries")]
    pub retries: u32,
    /// Wait after starting a session before querying it (default 2000 ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

/// Response polling cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Sleep between reads, and between background queue runs (default 100 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

/// SMS storage and mode.
#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    /// `AT+CPMS` memory: `SM` (SIM) or `ME`/`MT` (default `SM`).
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Text mode (default true). PDU listings are not decoded.
    #[serde(default = "default_text_mode")]
    pub text_mode: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_status_ms() -> u64 {
    3000
}
fn default_gps_ms() -> u64 {
    10_000
}
fn default_sms_ms() -> u64 {
    5000
}
fn default_sms_send_ms() -> u64 {
    30_000
}
fn default_gps_retries() -> u32 {
    3
}
fn default_settle_delay_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_storage() -> String {
    "SM".to_string()
}
fn default_text_mode() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            status_ms: default_status_ms(),
            gps_ms: default_gps_ms(),
            sms_ms: default_sms_ms(),
            sms_send_ms: default_sms_send_ms(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            retries: default_gps_retries(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            text_mode: default_text_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `simcomd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, Error> {
        let mut config = if let Some(p) = path {
            Self::from_file(&expand_tilde(p))?
        } else if Path::new(DEFAULT_FILE).exists() {
            Self::from_file(DEFAULT_FILE)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse {path}: {e}")))
    }

    /// Env var overrides, read through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(port) = lookup("SIM7600_PORT").filter(|p| !p.is_empty()) {
            self.serial.device = Some(port);
        }
        if let Some(baud) = lookup("SIM7600_BAUD") {
            self.serial.baud_rate = baud
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("SIM7600_BAUD is not a number: {baud:?}")))?;
        }
        if let Some(level) = lookup("SIMCOMD_LOG") {
            self.logging.level = level;
        }
        if let Some(device) = &self.serial.device {
            self.serial.device = Some(expand_tilde(device).into_owned());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.status_ms)
    }

    pub fn gps_timeouts(&self) -> GpsTimeouts {
        GpsTimeouts {
            status: self.status_timeout(),
            command: Duration::from_millis(self.timeouts.gps_ms),
            settle: Duration::from_millis(self.gps.settle_delay_ms),
        }
    }

    pub fn sms_timeouts(&self) -> SmsTimeouts {
        SmsTimeouts {
            command: Duration::from_millis(self.timeouts.sms_ms),
            send: Duration::from_millis(self.timeouts.sms_send_ms),
        }
    }
}
