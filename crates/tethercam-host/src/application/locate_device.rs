//! Device Registry: resolves the target camera's current bus address.
//!
//! The bus address of a USB device is assigned by the host and may change
//! whenever the camera is re-plugged, so it is looked up again at the start
//! of every attempt.  The registry keeps the last resolved [`Device`] only to
//! notice (and log) such drift.

use std::sync::Arc;
use std::time::Duration;

use tethercam_core::{BusAddress, Device, FailureKind, StageFailure, UsbId};
use tokio::time;
use tracing::{debug, info, warn};

use crate::infrastructure::process::DriverError;
use crate::infrastructure::redirection::{HostDeviceEntry, RedirectionDriver};

/// Finds the target device in the host listing.
pub struct DeviceRegistry {
    driver: Arc<dyn RedirectionDriver>,
    bus_hint: Option<BusAddress>,
    cached: Option<Device>,
}

impl DeviceRegistry {
    /// `bus_hint` breaks ties when several devices share the target identity.
    pub fn new(driver: Arc<dyn RedirectionDriver>, bus_hint: Option<BusAddress>) -> Self {
        Self {
            driver,
            bus_hint,
            cached: None,
        }
    }

    /// The device resolved by the most recent successful [`locate`](Self::locate).
    pub fn cached(&self) -> Option<&Device> {
        self.cached.as_ref()
    }

    /// Resolves the device with identity `id`.
    ///
    /// # Errors
    ///
    /// - [`FailureKind::DeviceNotFound`] when no listed device matches.
    /// - [`FailureKind::PassthroughTimeout`] when the listing exceeds `timeout`.
    /// - [`FailureKind::RedirectionMechanismUnreachable`] when the host
    ///   redirection facility is not available at all.
    pub async fn locate(&mut self, id: UsbId, timeout: Duration) -> Result<Device, StageFailure> {
        let entries = match time::timeout(timeout, self.driver.list_devices()).await {
            Err(_) => {
                return Err(StageFailure::new(
                    FailureKind::PassthroughTimeout,
                    format!("host device listing exceeded {timeout:?}"),
                ))
            }
            Ok(Err(err)) => return Err(listing_failure(err)),
            Ok(Ok(entries)) => entries,
        };

        let candidates: Vec<&HostDeviceEntry> = entries.iter().filter(|e| e.id == id).collect();
        let chosen = select_candidate(&candidates, self.bus_hint.as_ref()).ok_or_else(|| {
            StageFailure::new(
                FailureKind::DeviceNotFound,
                format!("no device with id {id} among {} listed", entries.len()),
            )
        })?;

        if candidates.len() > 1 {
            let addresses: Vec<&str> = candidates.iter().map(|c| c.bus_address.as_str()).collect();
            warn!(
                "{} devices match {id} ({}); using {}",
                candidates.len(),
                addresses.join(", "),
                chosen.bus_address
            );
        }

        let device = Device::new(chosen.id, chosen.bus_address.clone(), chosen.state)
            .with_description(chosen.description.clone());

        match &self.cached {
            Some(previous) if previous.bus_address != device.bus_address => {
                info!(
                    "bus address of {id} drifted from {} to {}",
                    previous.bus_address, device.bus_address
                );
            }
            _ => debug!("located {id} at {} ({})", device.bus_address, device.state),
        }

        self.cached = Some(device.clone());
        Ok(device)
    }
}

/// Prefers the candidate at `hint`; otherwise the first one listed.
fn select_candidate<'a>(
    candidates: &[&'a HostDeviceEntry],
    hint: Option<&BusAddress>,
) -> Option<&'a HostDeviceEntry> {
    hint.and_then(|hint| candidates.iter().find(|c| &c.bus_address == hint).copied())
        .or_else(|| candidates.first().copied())
}

fn listing_failure(err: DriverError) -> StageFailure {
    match err {
        DriverError::Unavailable(detail) => {
            StageFailure::new(FailureKind::RedirectionMechanismUnreachable, detail)
        }
        DriverError::Timeout(after) => StageFailure::new(
            FailureKind::PassthroughTimeout,
            format!("host device listing timed out after {after:?}"),
        ),
        DriverError::PermissionDenied(detail) | DriverError::Rejected(detail) => {
            StageFailure::new(FailureKind::PassthroughRejected, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::redirection::mock::{HostOp, HostScript, MockHost};
    use tethercam_core::RedirectionState;

    const CAMERA: UsbId = UsbId::new(0x04b0, 0x0454);
    const TIMEOUT: Duration = Duration::from_millis(100);

    fn bus(s: &str) -> BusAddress {
        s.parse().expect("valid bus address")
    }

    #[tokio::test]
    async fn test_locate_finds_device_by_identity() {
        // Arrange
        let host = Arc::new(MockHost::with_device(
            UsbId::new(0x046d, 0xc52b),
            bus("2-1"),
            RedirectionState::Unbound,
        ));
        host.plug(CAMERA, bus("1-4"), RedirectionState::Bound);
        let mut registry = DeviceRegistry::new(host, None);

        // Act
        let device = registry.locate(CAMERA, TIMEOUT).await.expect("located");

        // Assert
        assert_eq!(device.bus_address, bus("1-4"));
        assert_eq!(device.state, RedirectionState::Bound);
    }

    #[tokio::test]
    async fn test_locate_missing_device_is_device_not_found() {
        let host = Arc::new(MockHost::new());
        let mut registry = DeviceRegistry::new(host, None);

        let err = registry.locate(CAMERA, TIMEOUT).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_locate_is_consistent_when_nothing_changed() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        let mut registry = DeviceRegistry::new(host, None);

        let first = registry.locate(CAMERA, TIMEOUT).await.expect("first");
        let second = registry.locate(CAMERA, TIMEOUT).await.expect("second");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_locate_adopts_new_bus_address_after_replug() {
        // Arrange
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        let mut registry = DeviceRegistry::new(host.clone(), None);
        registry.locate(CAMERA, TIMEOUT).await.expect("first");

        // Act
        host.replug(&bus("1-4"), bus("3-2"));
        let device = registry.locate(CAMERA, TIMEOUT).await.expect("after replug");

        // Assert
        assert_eq!(device.bus_address, bus("3-2"));
        assert_eq!(registry.cached().map(|d| d.bus_address.clone()), Some(bus("3-2")));
    }

    #[tokio::test]
    async fn test_locate_prefers_bus_hint_among_duplicates() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        host.plug(CAMERA, bus("2-7"), RedirectionState::Bound);
        let mut registry = DeviceRegistry::new(host, Some(bus("2-7")));

        let device = registry.locate(CAMERA, TIMEOUT).await.expect("located");

        assert_eq!(device.bus_address, bus("2-7"));
    }

    #[tokio::test]
    async fn test_locate_first_match_wins_without_hint() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        host.plug(CAMERA, bus("2-7"), RedirectionState::Bound);
        let mut registry = DeviceRegistry::new(host, None);

        let device = registry.locate(CAMERA, TIMEOUT).await.expect("located");

        assert_eq!(device.bus_address, bus("1-4"));
    }

    #[tokio::test]
    async fn test_locate_listing_timeout_is_passthrough_timeout() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        host.script(HostOp::List, HostScript::Hang);
        let mut registry = DeviceRegistry::new(host, None);

        let err = registry.locate(CAMERA, TIMEOUT).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::PassthroughTimeout);
    }

    #[tokio::test]
    async fn test_locate_without_mechanism_is_fatal_kind() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound));
        host.set_unavailable(true);
        let mut registry = DeviceRegistry::new(host, None);

        let err = registry.locate(CAMERA, TIMEOUT).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::RedirectionMechanismUnreachable);
        assert!(err.kind.is_fatal());
    }
}
