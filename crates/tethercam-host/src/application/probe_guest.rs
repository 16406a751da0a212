//! Guest Health Prober: can the capture tool in the guest see and open the
//! camera?
//!
//! The probe only enumerates; it never triggers a capture.  Telling
//! "missing" apart from "present but not accessible" takes two listings: an
//! unprivileged one, and on a permission error a privileged retry.

use std::sync::Arc;
use std::time::Duration;

use tethercam_core::{FailureKind, StageFailure};
use tokio::time;
use tracing::{debug, warn};

use crate::infrastructure::guest::{GuestCamera, GuestDriver};
use crate::infrastructure::process::DriverError;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The camera is listed and accessible; carries the preferred port.
    Healthy(GuestCamera),
    Unreachable(String),
    /// Visible only with elevated rights.
    PermissionDenied(String),
}

impl ProbeVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Converts the verdict into a pipeline result.
    pub fn into_result(self) -> Result<GuestCamera, StageFailure> {
        match self {
            Self::Healthy(camera) => Ok(camera),
            Self::Unreachable(detail) => Err(StageFailure::new(FailureKind::Unreachable, detail)),
            Self::PermissionDenied(detail) => {
                Err(StageFailure::new(FailureKind::PermissionDenied, detail))
            }
        }
    }
}

/// Probes guest-side camera visibility.
pub struct GuestHealthProber {
    guest: Arc<dyn GuestDriver>,
    timeout: Duration,
}

impl GuestHealthProber {
    pub fn new(guest: Arc<dyn GuestDriver>, timeout: Duration) -> Self {
        Self { guest, timeout }
    }

    pub async fn probe(&self) -> ProbeVerdict {
        let denial = match self.list(false).await {
            Ok(cameras) => {
                return match preferred_camera(cameras) {
                    Some(camera) => {
                        debug!("guest sees {} on {}", camera.model, camera.port);
                        ProbeVerdict::Healthy(camera)
                    }
                    None => ProbeVerdict::Unreachable("capture tool lists no cameras".into()),
                };
            }
            Err(DriverError::PermissionDenied(detail)) => detail,
            Err(err) => return ProbeVerdict::Unreachable(err.to_string()),
        };

        warn!("unprivileged listing denied ({denial}); retrying with elevation");
        match self.list(true).await {
            Ok(cameras) if !cameras.is_empty() => ProbeVerdict::PermissionDenied(format!(
                "{denial}; privileged listing sees {} camera(s)",
                cameras.len()
            )),
            Ok(_) => ProbeVerdict::Unreachable(format!(
                "{denial}; privileged listing is empty too"
            )),
            Err(err) => ProbeVerdict::Unreachable(format!(
                "{denial}; privileged listing failed: {err}"
            )),
        }
    }

    async fn list(&self, privileged: bool) -> Result<Vec<GuestCamera>, DriverError> {
        time::timeout(self.timeout, self.guest.list_cameras(privileged))
            .await
            .unwrap_or(Err(DriverError::Timeout(self.timeout)))
    }
}

/// Picks a USB port when the camera is listed on several.
pub fn preferred_camera(cameras: Vec<GuestCamera>) -> Option<GuestCamera> {
    let usb = cameras.iter().position(GuestCamera::is_usb);
    cameras.into_iter().nth(usb.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::guest::MockGuestDriver;
    use mockall::predicate::eq;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn z6() -> GuestCamera {
        GuestCamera::new("Nikon DSC Z6_3", "usb:001,004")
    }

    fn prober(mock: MockGuestDriver) -> GuestHealthProber {
        GuestHealthProber::new(Arc::new(mock), TIMEOUT)
    }

    #[tokio::test]
    async fn test_probe_healthy_when_camera_listed() {
        // Arrange
        let mut mock = MockGuestDriver::new();
        mock.expect_list_cameras()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(vec![z6()]));

        // Act
        let verdict = prober(mock).probe().await;

        // Assert
        assert_eq!(verdict, ProbeVerdict::Healthy(z6()));
    }

    #[tokio::test]
    async fn test_probe_empty_listing_is_unreachable() {
        let mut mock = MockGuestDriver::new();
        mock.expect_list_cameras().with(eq(false)).returning(|_| Ok(vec![]));

        let verdict = prober(mock).probe().await;

        assert!(matches!(verdict, ProbeVerdict::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_probe_permission_denied_when_only_privileged_sees_camera() {
        // Arrange
        let mut mock = MockGuestDriver::new();
        mock.expect_list_cameras()
            .with(eq(false))
            .times(1)
            .returning(|_| Err(DriverError::PermissionDenied("Could not claim the USB device".into())));
        mock.expect_list_cameras()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(vec![z6()]));

        // Act
        let verdict = prober(mock).probe().await;

        // Assert
        assert!(matches!(verdict, ProbeVerdict::PermissionDenied(_)));
        let failure = verdict.into_result().unwrap_err();
        assert_eq!(failure.kind, FailureKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_probe_unreachable_when_privileged_listing_empty() {
        let mut mock = MockGuestDriver::new();
        mock.expect_list_cameras()
            .with(eq(false))
            .returning(|_| Err(DriverError::PermissionDenied("denied".into())));
        mock.expect_list_cameras().with(eq(true)).returning(|_| Ok(vec![]));

        let verdict = prober(mock).probe().await;

        assert!(matches!(verdict, ProbeVerdict::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_probe_guest_down_is_unreachable_without_privileged_retry() {
        let mut mock = MockGuestDriver::new();
        mock.expect_list_cameras()
            .with(eq(false))
            .times(1)
            .returning(|_| Err(DriverError::Unavailable("distro not found".into())));
        mock.expect_list_cameras().with(eq(true)).never();

        let verdict = prober(mock).probe().await;

        assert!(matches!(verdict, ProbeVerdict::Unreachable(ref d) if d.contains("distro not found")));
    }

    #[test]
    fn test_preferred_camera_picks_usb_port() {
        let cameras = vec![GuestCamera::new("Nikon DSC Z6_3", "ptpip:10.0.0.2"), z6()];
        assert_eq!(preferred_camera(cameras), Some(z6()));
    }

    #[test]
    fn test_preferred_camera_falls_back_to_first() {
        let ptp = GuestCamera::new("Nikon DSC Z6_3", "ptpip:10.0.0.2");
        assert_eq!(preferred_camera(vec![ptp.clone()]), Some(ptp));
        assert_eq!(preferred_camera(vec![]), None);
    }
}
