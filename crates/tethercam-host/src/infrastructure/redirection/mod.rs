//! Host-side USB redirection facility.
//!
//! The [`RedirectionDriver`] trait is the seam between the application layer
//! and whatever shares USB devices from the host into the guest.  The
//! production implementation shells out to `usbipd` ([`usbipd::UsbipdDriver`]);
//! tests use the scriptable [`mock::MockHost`].
//!
//! # Bind vs. attach (for beginners)
//!
//! Redirection is two steps.  *Binding* marks a device as shareable on the
//! host (an administrative step that survives reboots).  *Attaching* actually
//! hands the device to the guest, at which point the host can no longer use
//! it.  Detaching reverses the second step only; the device stays bound.

pub mod mock;
pub mod usbipd;

use async_trait::async_trait;
use tethercam_core::{BusAddress, RedirectionState, UsbId};

use crate::infrastructure::process::DriverError;

/// One row of the host's device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceEntry {
    pub bus_address: BusAddress,
    pub id: UsbId,
    pub description: String,
    pub state: RedirectionState,
}

/// Operations the host redirection facility exposes.
///
/// Implementations perform exactly one tool invocation per call and report
/// the outcome; idempotence and ordering rules live in the application layer.
#[async_trait]
pub trait RedirectionDriver: Send + Sync {
    /// Lists every USB device the host currently sees.
    async fn list_devices(&self) -> Result<Vec<HostDeviceEntry>, DriverError>;

    /// Marks the device at `bus` as shareable.  `force` overrides a
    /// conflicting host driver claim.
    async fn bind(&self, bus: &BusAddress, force: bool) -> Result<(), DriverError>;

    /// Hands the bound device at `bus` to the guest.
    async fn attach(&self, bus: &BusAddress) -> Result<(), DriverError>;

    /// Takes the device at `bus` back from the guest.
    async fn detach(&self, bus: &BusAddress) -> Result<(), DriverError>;
}
