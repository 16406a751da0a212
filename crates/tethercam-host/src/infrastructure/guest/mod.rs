//! Guest-side capture facility.
//!
//! The [`GuestDriver`] trait covers everything the orchestrator asks of the
//! guest environment: listing cameras, running one capture, killing a stuck
//! capture, repairing device permissions, and restarting the guest.  The
//! production implementation runs `gphoto2` inside a WSL distribution
//! ([`wsl::WslGphotoDriver`]); tests use [`mock::MockGuest`].

pub mod mock;
pub mod wsl;

use std::path::Path;

use async_trait::async_trait;

use crate::infrastructure::process::{DriverError, ToolOutput};

/// Capture tool diagnostics meaning the camera is visible but cannot be opened.
pub const PERMISSION_MARKERS: &[&str] = &[
    "could not claim the usb device",
    "could not claim interface",
    "permission denied",
    "insufficient permissions",
    "access denied",
];

/// A camera as reported by the guest capture tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCamera {
    pub model: String,
    /// Tool-specific port string, e.g. `usb:001,004`.
    pub port: String,
}

impl GuestCamera {
    pub fn new(model: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            port: port.into(),
        }
    }

    pub fn is_usb(&self) -> bool {
        self.port.starts_with("usb:")
    }
}

/// Operations the guest capture facility exposes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuestDriver: Send + Sync {
    /// Lists cameras the capture tool can see.  `privileged` runs the tool
    /// with elevated rights so a permission problem can be told apart from
    /// a missing device.
    async fn list_cameras(&self, privileged: bool) -> Result<Vec<GuestCamera>, DriverError>;

    /// Captures one image straight into `target` (a host path).
    ///
    /// A non-zero tool exit is reported through [`ToolOutput`], not as an
    /// error; `Err` means the tool could not be run at all.
    async fn capture(&self, target: &Path, port: Option<String>) -> Result<ToolOutput, DriverError>;

    /// Forcefully kills any capture tool process still running in the guest.
    async fn terminate_capture(&self) -> Result<(), DriverError>;

    /// Privileged repair of guest-side USB access: loads the virtual host
    /// controller module, stops desktop services that grab cameras, and
    /// opens up device node permissions.
    async fn repair_access(&self) -> Result<(), DriverError>;

    /// Shuts the guest down and boots it again.
    async fn restart(&self) -> Result<(), DriverError>;
}
