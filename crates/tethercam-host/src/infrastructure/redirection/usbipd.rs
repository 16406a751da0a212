//! `usbipd` implementation of [`RedirectionDriver`].
//!
//! Wraps the `usbipd list`, `bind`, `attach --wsl`, and `detach` subcommands.
//! The listing is parsed from the human-readable table `usbipd list` prints:
//!
//! ```text
//! Connected:
//! BUSID  VID:PID    DEVICE                                   STATE
//! 1-4    04b0:0454  Z6_3, USB PTP Class Camera               Shared
//! 2-1    046d:c52b  Logitech USB Input Device                Not shared
//!
//! Persisted:
//! GUID                                  DEVICE
//! ```

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tethercam_core::{BusAddress, RedirectionState, UsbId};
use tracing::{debug, warn};

use super::{HostDeviceEntry, RedirectionDriver};
use crate::infrastructure::process::{self, DriverError, ToolOutput};

/// Messages meaning the usbipd service (not the request) is the problem.
const SERVICE_DOWN_MARKERS: &[&str] = &[
    "service is currently not running",
    "service is not running",
    "the system cannot find the file specified",
];

const ELEVATION_MARKERS: &[&str] = &["administrator", "access is denied", "elevation"];

/// State column suffixes, checked in order (longest first).
const STATE_SUFFIXES: &[(&str, RedirectionState)] = &[
    ("Not shared", RedirectionState::Unbound),
    ("Shared (forced)", RedirectionState::Bound),
    ("Shared", RedirectionState::Bound),
];

/// Drives `usbipd` on the Windows host.
#[derive(Debug, Clone)]
pub struct UsbipdDriver {
    exe: PathBuf,
    distro: String,
    command_timeout: Duration,
}

impl UsbipdDriver {
    /// `exe` is the path to `usbipd.exe`; `distro` names the WSL distribution
    /// devices are attached to.  `command_timeout` is a hard cap on any single
    /// invocation; the application layer normally enforces a tighter one.
    pub fn new(exe: impl Into<PathBuf>, distro: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            distro: distro.into(),
            command_timeout,
        }
    }

    async fn invoke(&self, args: &[&str]) -> Result<ToolOutput, DriverError> {
        Ok(process::run(&self.exe, args, self.command_timeout).await?)
    }
}

#[async_trait]
impl RedirectionDriver for UsbipdDriver {
    async fn list_devices(&self) -> Result<Vec<HostDeviceEntry>, DriverError> {
        listing(self.invoke(&["list"]).await?)
    }

    async fn bind(&self, bus: &BusAddress, force: bool) -> Result<(), DriverError> {
        let mut args = vec!["bind", "--busid", bus.as_str()];
        if force {
            args.push("--force");
        }
        let out = self.invoke(&args).await?;
        if out.is_success() {
            return Ok(());
        }
        Err(classify_failure(&out))
    }

    async fn attach(&self, bus: &BusAddress) -> Result<(), DriverError> {
        let out = self
            .invoke(&["attach", "--wsl", &self.distro, "--busid", bus.as_str()])
            .await?;
        if out.is_success() {
            return Ok(());
        }
        if out.mentions_any(&["already attached"]) {
            debug!("usbipd reports {bus} already attached");
            return Ok(());
        }
        Err(classify_failure(&out))
    }

    async fn detach(&self, bus: &BusAddress) -> Result<(), DriverError> {
        let out = self.invoke(&["detach", "--busid", bus.as_str()]).await?;
        if out.is_success() || out.mentions_any(&["not attached"]) {
            return Ok(());
        }
        Err(classify_failure(&out))
    }
}

/// Result of one `usbipd list` run.
///
/// A failed listing is only fatal when the service itself is down; any other
/// failure is a rejected request the caller may retry.
fn listing(out: ToolOutput) -> Result<Vec<HostDeviceEntry>, DriverError> {
    if !out.is_success() {
        return Err(classify_failure(&out));
    }
    Ok(parse_list(&out.stdout))
}

fn classify_failure(out: &ToolOutput) -> DriverError {
    let detail = out.diagnostics();
    if out.mentions_any(SERVICE_DOWN_MARKERS) {
        DriverError::Unavailable(detail)
    } else if out.mentions_any(ELEVATION_MARKERS) {
        DriverError::PermissionDenied(detail)
    } else {
        DriverError::Rejected(detail)
    }
}

/// Parses the `Connected:` table of `usbipd list`.
///
/// Rows that do not start with a bus address and a `VID:PID` pair are
/// skipped, as is everything after the `Persisted:` heading.
pub fn parse_list(stdout: &str) -> Vec<HostDeviceEntry> {
    let mut entries = Vec::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Persisted") {
            break;
        }
        if trimmed.is_empty() || trimmed.starts_with("Connected") || trimmed.starts_with("BUSID") {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let (Some(bus), Some(vid_pid)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(bus_address), Ok(id)) = (bus.parse::<BusAddress>(), vid_pid.parse::<UsbId>()) else {
            continue;
        };
        let Some(rest) = trimmed
            .find(vid_pid)
            .map(|idx| &trimmed[idx + vid_pid.len()..])
        else {
            continue;
        };

        match split_state(rest.trim()) {
            Some((description, state)) => entries.push(HostDeviceEntry {
                bus_address,
                id,
                description,
                state,
            }),
            None => warn!("unrecognised usbipd state in row: {trimmed}"),
        }
    }

    entries
}

/// Splits `"<description>   <state>"` into its parts.
fn split_state(rest: &str) -> Option<(String, RedirectionState)> {
    for (suffix, state) in STATE_SUFFIXES {
        if let Some(description) = rest.strip_suffix(suffix) {
            return Some((description.trim().to_string(), *state));
        }
    }
    // Older releases print "Attached - <distro>".
    rest.rfind("Attached")
        .map(|idx| (rest[..idx].trim().to_string(), RedirectionState::Attached))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Connected:
BUSID  VID:PID    DEVICE                                                        STATE
1-4    04b0:0454  Z6_3, USB PTP Class Camera                                    Shared
2-1    046d:c52b  Logitech USB Input Device, USB Input Device                   Not shared
2-3    8087:0026  Intel(R) Wireless Bluetooth(R)                                Attached
3-1    0bda:8153  Realtek USB GbE Family Controller                             Shared (forced)

Persisted:
GUID                                  DEVICE
5d1f5c4b-2f7a-4a28-9d44-8a0f1e0a0c11  Old Camera
";

    #[test]
    fn test_parse_list_reads_all_connected_rows() {
        // Act
        let entries = parse_list(SAMPLE);

        // Assert
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].bus_address.as_str(), "1-4");
        assert_eq!(entries[0].id, UsbId::new(0x04b0, 0x0454));
        assert_eq!(entries[0].description, "Z6_3, USB PTP Class Camera");
    }

    #[test]
    fn test_parse_list_maps_state_column() {
        let entries = parse_list(SAMPLE);
        let states: Vec<_> = entries.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                RedirectionState::Bound,
                RedirectionState::Unbound,
                RedirectionState::Attached,
                RedirectionState::Bound,
            ]
        );
    }

    #[test]
    fn test_parse_list_ignores_persisted_section() {
        let entries = parse_list(SAMPLE);
        assert!(entries.iter().all(|e| e.description != "Old Camera"));
    }

    #[test]
    fn test_parse_list_handles_legacy_attached_suffix() {
        let legacy = "BUSID  VID:PID    DEVICE          STATE\n\
                      1-7    04b0:0454  Z6_3            Attached - Ubuntu\n";
        let entries = parse_list(legacy);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, RedirectionState::Attached);
        assert_eq!(entries[0].description, "Z6_3");
    }

    #[test]
    fn test_parse_list_skips_malformed_rows() {
        let noisy = "usbipd: warning: unknown USB filter 'edevmon'\n\
                     1-4    04b0:0454  Camera   Shared\n";
        let entries = parse_list(noisy);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_parse_list_empty_output() {
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_listing_generic_failure_is_rejected_not_unavailable() {
        // Arrange
        let out = ToolOutput::failure(1, "usbipd: error: Unexpected error while enumerating devices.");

        // Act
        let result = listing(out);

        // Assert
        assert!(matches!(result, Err(DriverError::Rejected(_))));
    }

    #[test]
    fn test_listing_service_down_is_unavailable() {
        let out = ToolOutput::failure(1, "usbipd: error: The service is currently not running.");
        assert!(matches!(listing(out), Err(DriverError::Unavailable(_))));
    }

    #[test]
    fn test_listing_success_parses_rows() {
        let entries = listing(ToolOutput::success(SAMPLE)).expect("listing");
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_classify_failure_service_down_is_unavailable() {
        let out = ToolOutput::failure(1, "usbipd: error: The service is currently not running.");
        assert!(matches!(classify_failure(&out), DriverError::Unavailable(_)));
    }

    #[test]
    fn test_classify_failure_needs_admin_is_permission_denied() {
        let out = ToolOutput::failure(1, "usbipd: error: Access denied; this operation requires administrator privileges.");
        assert!(matches!(classify_failure(&out), DriverError::PermissionDenied(_)));
    }

    #[test]
    fn test_classify_failure_other_is_rejected() {
        let out = ToolOutput::failure(1, "usbipd: error: There is no device with busid '9-9'.");
        assert_eq!(
            classify_failure(&out),
            DriverError::Rejected("usbipd: error: There is no device with busid '9-9'.".into())
        );
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let driver = UsbipdDriver::new("/nonexistent/usbipd.exe", "Ubuntu", Duration::from_secs(1));
        let result = driver.list_devices().await;
        assert!(matches!(result, Err(DriverError::Unavailable(_))));
    }
}
