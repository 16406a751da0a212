//! WSL + `gphoto2` implementation of [`GuestDriver`].
//!
//! Every guest command runs as `wsl -d <distro> -- bash -lc '<script>'`.
//! Privileged commands use `sudo -n` so a missing sudoers rule fails fast
//! instead of blocking on a password prompt.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{GuestCamera, GuestDriver, PERMISSION_MARKERS};
use crate::infrastructure::process::{self, shell_quote, DriverError, ToolOutput};

/// Diagnostics meaning the guest itself is not running or not installed.
const GUEST_DOWN_MARKERS: &[&str] = &[
    "there is no distribution with the supplied name",
    "wsl_e_distro_not_found",
    "the windows subsystem for linux has not been enabled",
];

const WSL: &str = "wsl";

/// Drives `gphoto2` inside a WSL distribution.
#[derive(Debug, Clone)]
pub struct WslGphotoDriver {
    distro: String,
    gphoto_cmd: String,
    command_timeout: Duration,
    autofocus: bool,
}

impl WslGphotoDriver {
    pub fn new(distro: impl Into<String>, gphoto_cmd: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            distro: distro.into(),
            gphoto_cmd: gphoto_cmd.into(),
            command_timeout,
            autofocus: false,
        }
    }

    /// Drive the lens autofocus before every capture.
    ///
    /// The focus command is best effort: bodies without an `autofocusdrive`
    /// setting, or in manual focus, still capture.
    pub fn with_autofocus(mut self, enabled: bool) -> Self {
        self.autofocus = enabled;
        self
    }

    async fn bash(&self, script: &str) -> Result<ToolOutput, DriverError> {
        debug!(distro = %self.distro, "guest: {script}");
        let out = process::run(
            WSL,
            ["-d", self.distro.as_str(), "--", "bash", "-lc", script],
            self.command_timeout,
        )
        .await?;
        if !out.is_success() && out.mentions_any(GUEST_DOWN_MARKERS) {
            return Err(DriverError::Unavailable(out.diagnostics()));
        }
        Ok(out)
    }

    fn sudo(&self, command: &str) -> String {
        format!("sudo -n {command}")
    }

    fn capture_script(&self, guest_path: &str, port: Option<&str>) -> String {
        let port_arg = port
            .map(|p| format!("--port {} ", shell_quote(p)))
            .unwrap_or_default();
        let capture = format!(
            "{} {}--capture-image-and-download --filename {}",
            self.gphoto_cmd,
            port_arg,
            shell_quote(guest_path)
        );
        if !self.autofocus {
            return capture;
        }
        // Only the capture's exit status reaches the caller.
        format!(
            "{} {}--set-config autofocusdrive=1 >/dev/null 2>&1 || true; {capture}",
            self.gphoto_cmd, port_arg
        )
    }
}

#[async_trait]
impl GuestDriver for WslGphotoDriver {
    async fn list_cameras(&self, privileged: bool) -> Result<Vec<GuestCamera>, DriverError> {
        let listing = format!("{} --auto-detect", self.gphoto_cmd);
        let script = if privileged { self.sudo(&listing) } else { listing };
        let out = self.bash(&script).await?;

        if !out.is_success() {
            if out.mentions_any(PERMISSION_MARKERS) {
                return Err(DriverError::PermissionDenied(out.diagnostics()));
            }
            return Err(DriverError::Rejected(out.diagnostics()));
        }
        if out.mentions_any(PERMISSION_MARKERS) {
            // Newer gphoto2 releases exit 0 but still print the claim error.
            return Err(DriverError::PermissionDenied(out.diagnostics()));
        }
        Ok(parse_auto_detect(&out.stdout))
    }

    async fn capture(&self, target: &Path, port: Option<String>) -> Result<ToolOutput, DriverError> {
        let guest_path = host_to_guest_path(target);
        let script = self.capture_script(&guest_path, port.as_deref());
        info!(autofocus = self.autofocus, "capturing to {guest_path}");
        self.bash(&script).await
    }

    async fn terminate_capture(&self) -> Result<(), DriverError> {
        let out = self.bash("pkill -KILL -x gphoto2 || true").await?;
        if !out.is_success() {
            warn!("guest-side kill of gphoto2 failed: {}", out.diagnostics());
        }
        Ok(())
    }

    async fn repair_access(&self) -> Result<(), DriverError> {
        let script = [
            self.sudo("modprobe vhci-hcd"),
            self.sudo("pkill -f gvfs-gphoto2-volume-monitor || true"),
            self.sudo("chmod -R a+rw /dev/bus/usb"),
        ]
        .join(" && ");
        let out = self.bash(&script).await?;
        if out.is_success() {
            info!("guest USB access repaired");
            return Ok(());
        }
        if out.mentions_any(&["a password is required", "not in the sudoers"]) {
            return Err(DriverError::PermissionDenied(out.diagnostics()));
        }
        Err(DriverError::Rejected(out.diagnostics()))
    }

    async fn restart(&self) -> Result<(), DriverError> {
        info!(distro = %self.distro, "restarting guest");
        let out = process::run(WSL, ["--shutdown"], self.command_timeout).await?;
        if !out.is_success() {
            warn!("wsl --shutdown exited with {:?}: {}", out.exit_code, out.diagnostics());
        }

        let boot = self.bash("true").await?;
        if !boot.is_success() {
            return Err(DriverError::Unavailable(boot.diagnostics()));
        }

        // The virtual host controller module does not survive a restart.
        let modules = self.bash(&format!("{} 2>/dev/null || true", self.sudo("modprobe vhci-hcd"))).await?;
        if !modules.is_success() {
            warn!("could not load vhci-hcd after restart: {}", modules.diagnostics());
        }
        Ok(())
    }
}

/// Parses `gphoto2 --auto-detect` output.
///
/// ```text
/// Model                          Port
/// ----------------------------------------------------------
/// Nikon DSC Z6_3                 usb:001,004
/// ```
pub fn parse_auto_detect(stdout: &str) -> Vec<GuestCamera> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('-') && !line.starts_with("Model"))
        .filter_map(|line| {
            let (model, port) = line.rsplit_once(char::is_whitespace)?;
            let model = model.trim();
            if model.is_empty() {
                return None;
            }
            Some(GuestCamera::new(model, port.trim()))
        })
        .collect()
}

/// Translates a host path into the guest's view of it.
///
/// `C:\Users\booth\img.jpg` becomes `/mnt/c/Users/booth/img.jpg`; paths
/// without a drive letter only have their separators normalised.
pub fn host_to_guest_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = raw[2..].replace('\\', "/");
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return format!("/mnt/{drive}");
        }
        return format!("/mnt/{drive}/{rest}");
    }
    raw.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_auto_detect_skips_header_and_separator() {
        // Arrange
        let out = "Model                          Port\n\
                   ----------------------------------------------------------\n\
                   Nikon DSC Z6_3                 usb:001,004\n";

        // Act
        let cameras = parse_auto_detect(out);

        // Assert
        assert_eq!(cameras, vec![GuestCamera::new("Nikon DSC Z6_3", "usb:001,004")]);
        assert!(cameras[0].is_usb());
    }

    #[test]
    fn test_parse_auto_detect_multiple_ports() {
        let out = "Model    Port\n-----\nNikon DSC Z6_3   ptpip:192.168.1.2\nNikon DSC Z6_3   usb:001,004\n";
        let cameras = parse_auto_detect(out);
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[1].port, "usb:001,004");
    }

    #[test]
    fn test_parse_auto_detect_empty_listing() {
        let out = "Model                          Port\n------------------------------\n";
        assert!(parse_auto_detect(out).is_empty());
    }

    fn driver() -> WslGphotoDriver {
        WslGphotoDriver::new("Ubuntu", "gphoto2", Duration::from_secs(5))
    }

    #[test]
    fn test_capture_script_focuses_before_capturing() {
        // Arrange
        let driver = driver().with_autofocus(true);

        // Act
        let script = driver.capture_script("/mnt/c/shots/a.jpg", Some("usb:001,004"));

        // Assert
        let focus = script.find("--set-config autofocusdrive=1").expect("focus step");
        let capture = script.find("--capture-image-and-download").expect("capture step");
        assert!(focus < capture);
        assert!(script.contains("autofocusdrive=1 >/dev/null 2>&1 || true;"));
        assert!(script.starts_with("gphoto2 --port 'usb:001,004' --set-config"));
    }

    #[test]
    fn test_capture_script_without_autofocus_only_captures() {
        let script = driver().capture_script("/tmp/a.jpg", None);
        assert_eq!(script, "gphoto2 --capture-image-and-download --filename '/tmp/a.jpg'");
    }

    #[test]
    fn test_host_to_guest_path_drive_letter() {
        let path = PathBuf::from(r"C:\Users\booth\Desktop\Photos\img_1.jpg");
        assert_eq!(host_to_guest_path(&path), "/mnt/c/Users/booth/Desktop/Photos/img_1.jpg");
    }

    #[test]
    fn test_host_to_guest_path_lowercases_drive() {
        let path = PathBuf::from(r"D:\shots\a.jpg");
        assert_eq!(host_to_guest_path(&path), "/mnt/d/shots/a.jpg");
    }

    #[test]
    fn test_host_to_guest_path_posix_path_unchanged() {
        let path = PathBuf::from("/tmp/shots/a.jpg");
        assert_eq!(host_to_guest_path(&path), "/tmp/shots/a.jpg");
    }
}
