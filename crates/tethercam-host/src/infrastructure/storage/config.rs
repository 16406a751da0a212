//! TOML-based configuration for the capture orchestrator.
//!
//! The config file lives in the platform config directory unless a path is
//! given explicitly (`--config`):
//! - Windows:  `%APPDATA%\TetherCam\config.toml`
//! - Linux:    `~/.config/tethercam/config.toml`
//! - macOS:    `~/Library/Application Support/TetherCam/config.toml`
//!
//! # Example
//!
//! ```toml
//! log_level = "debug"
//!
//! [device]
//! vendor_id = "04b0"
//! product_id = "0454"
//!
//! [host]
//! distro = "Ubuntu"
//!
//! [policy]
//! max_attempts = 4
//! ladder = ["initial", "soft_reattach", "elevated_privilege"]
//! ```
//!
//! Every section and field is optional; `#[serde(default = "...")]` fills in
//! whatever is missing.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tethercam_core::{BackoffSchedule, BusAddress, EscalationStep, PolicyError, RecoveryPolicy, StageTimeouts, UsbId};
use thiserror::Error;
use uuid::Uuid;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is not usable.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid recovery policy: {0}")]
    Policy(#[from] PolicyError),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub guest: GuestConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Which camera to capture from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// USB vendor id, hex (e.g. `"04b0"` for Nikon).
    #[serde(default = "default_vendor_id")]
    pub vendor_id: String,
    /// USB product id, hex (e.g. `"0454"` for the Z6_3).
    #[serde(default = "default_product_id")]
    pub product_id: String,
    /// Preferred bus address when several devices share the identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_address_hint: Option<String>,
}

/// Host-side redirection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default = "default_usbipd_path")]
    pub usbipd_path: PathBuf,
    /// WSL distribution the camera is attached to.
    #[serde(default = "default_distro")]
    pub distro: String,
    /// Hard cap on any single external tool invocation.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// Guest-side capture tool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestConfig {
    #[serde(default = "default_gphoto_cmd")]
    pub gphoto_cmd: String,
    /// Trigger autofocus before each capture (best effort).
    #[serde(default = "default_true")]
    pub autofocus: bool,
}

/// Where captured images go when no explicit path is given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
}

/// Recovery policy as written in the file; see [`PolicyConfig::to_policy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_locate_timeout_ms")]
    pub locate_timeout_ms: u64,
    /// Applies to each bind / attach / detach call.
    #[serde(default = "default_passthrough_timeout_ms")]
    pub passthrough_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<EscalationStep>,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Supervisory health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub auto_repair: bool,
}

/// Session state persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    /// JSON state file; `None` keeps state in memory only.
    #[serde(default = "default_state_path", skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<PathBuf>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_vendor_id() -> String {
    "04b0".to_string()
}
fn default_product_id() -> String {
    "0454".to_string()
}
fn default_usbipd_path() -> PathBuf {
    PathBuf::from(r"C:\Program Files\usbipd-win\usbipd.exe")
}
fn default_distro() -> String {
    "Ubuntu".to_string()
}
fn default_command_timeout_secs() -> u64 {
    120
}
fn default_gphoto_cmd() -> String {
    "gphoto2".to_string()
}
fn default_output_dir() -> PathBuf {
    home_dir()
        .map(|home| home.join("Pictures").join("TetherCam"))
        .unwrap_or_else(|| PathBuf::from("captures"))
}
fn default_filename_prefix() -> String {
    "capture".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_locate_timeout_ms() -> u64 {
    8_000
}
fn default_passthrough_timeout_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    12_000
}
fn default_capture_timeout_ms() -> u64 {
    45_000
}
fn default_ladder() -> Vec<EscalationStep> {
    vec![
        EscalationStep::Initial,
        EscalationStep::SoftReattach,
        EscalationStep::ForcedRebind,
        EscalationStep::ElevatedPrivilege,
        EscalationStep::GuestReset,
    ]
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_monitor_interval_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_state_path() -> Option<PathBuf> {
    platform_config_dir().map(|dir| dir.join("state.json"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            host: HostConfig::default(),
            guest: GuestConfig::default(),
            output: OutputConfig::default(),
            policy: PolicyConfig::default(),
            monitor: MonitorConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: default_product_id(),
            bus_address_hint: None,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            usbipd_path: default_usbipd_path(),
            distro: default_distro(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            gphoto_cmd: default_gphoto_cmd(),
            autofocus: default_true(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            filename_prefix: default_filename_prefix(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            locate_timeout_ms: default_locate_timeout_ms(),
            passthrough_timeout_ms: default_passthrough_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
            ladder: default_ladder(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            auto_repair: default_true(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            persist_path: default_state_path(),
        }
    }
}

// ── Conversions into domain types ─────────────────────────────────────────────

impl DeviceConfig {
    /// Parses `vendor_id` / `product_id` into a [`UsbId`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when either id is not 1–4 hex digits.
    pub fn usb_id(&self) -> Result<UsbId, ConfigError> {
        format!("{}:{}", self.vendor_id, self.product_id)
            .parse()
            .map_err(|e| ConfigError::Invalid {
                field: "device.vendor_id/product_id",
                reason: format!("{e}"),
            })
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the hint is not a bus address.
    pub fn bus_hint(&self) -> Result<Option<BusAddress>, ConfigError> {
        self.bus_address_hint
            .as_deref()
            .map(|hint| {
                hint.parse().map_err(|e| ConfigError::Invalid {
                    field: "device.bus_address_hint",
                    reason: format!("{e}"),
                })
            })
            .transpose()
    }
}

impl HostConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl OutputConfig {
    /// A fresh path of the form `<directory>/<prefix>_<unix-ms>_<short-uuid>.jpg`.
    pub fn next_capture_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let id = Uuid::new_v4().simple().to_string();
        self.directory
            .join(format!("{}_{}_{}.jpg", self.filename_prefix, millis, &id[..8]))
    }
}

impl PolicyConfig {
    /// Builds a validated [`RecoveryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Policy`] when the values fail validation.
    pub fn to_policy(&self) -> Result<RecoveryPolicy, ConfigError> {
        let timeouts = StageTimeouts {
            locate: Duration::from_millis(self.locate_timeout_ms),
            passthrough: Duration::from_millis(self.passthrough_timeout_ms),
            probe: Duration::from_millis(self.probe_timeout_ms),
            capture: Duration::from_millis(self.capture_timeout_ms),
        };
        let backoff = BackoffSchedule {
            initial: Duration::from_millis(self.backoff_initial_ms),
            multiplier: self.backoff_multiplier,
            max: Duration::from_millis(self.backoff_max_ms),
        };
        Ok(RecoveryPolicy::new(
            self.max_attempts,
            timeouts,
            self.ladder.clone(),
            backoff,
        )?)
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

/// Resolves the platform config directory including the `TetherCam` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        // %APPDATA% e.g. C:\Users\<user>\AppData\Roaming
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("TetherCam"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("tethercam"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("TetherCam"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
