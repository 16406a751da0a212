//! Scriptable in-memory [`RedirectionDriver`] for tests.
//!
//! [`MockHost`] keeps a device table and applies bind/attach/detach to it the
//! way `usbipd` would.  Individual calls can be scripted to fail or to hang
//! forever, which is how timeouts and escalation are exercised without real
//! hardware.  Every call is recorded for later assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tethercam_core::{BusAddress, RedirectionState, UsbId};

use super::{HostDeviceEntry, RedirectionDriver};
use crate::infrastructure::process::DriverError;

/// Which driver operation a call or script applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    List,
    Bind,
    Attach,
    Detach,
}

/// One-shot behaviour override for the next call of an operation.
#[derive(Debug, Clone)]
pub enum HostScript {
    Fail(DriverError),
    /// Never completes; the caller's timeout must fire.
    Hang,
}

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCall {
    pub op: HostOp,
    pub bus: Option<BusAddress>,
    pub force: bool,
}

#[derive(Debug, Default)]
struct HostInner {
    devices: Vec<HostDeviceEntry>,
    scripts: HashMap<HostOp, VecDeque<HostScript>>,
    calls: Vec<HostCall>,
    unavailable: bool,
}

/// In-memory stand-in for the host redirection facility.
#[derive(Debug, Default)]
pub struct MockHost {
    inner: Mutex<HostInner>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor with a single device already plugged in.
    pub fn with_device(id: UsbId, bus_address: BusAddress, state: RedirectionState) -> Self {
        let host = Self::new();
        host.plug(id, bus_address, state);
        host
    }

    /// Adds a device to the listing.
    pub fn plug(&self, id: UsbId, bus_address: BusAddress, state: RedirectionState) {
        self.lock().devices.push(HostDeviceEntry {
            bus_address,
            id,
            description: format!("Mock device {id}"),
            state,
        });
    }

    /// Removes the device at `bus_address`.
    pub fn unplug(&self, bus_address: &BusAddress) {
        self.lock().devices.retain(|d| &d.bus_address != bus_address);
    }

    /// Simulates a re-plug that changes the device's bus address.  The device
    /// comes back unbound from the guest's point of view.
    pub fn replug(&self, from: &BusAddress, to: BusAddress) {
        let mut inner = self.lock();
        if let Some(device) = inner.devices.iter_mut().find(|d| &d.bus_address == from) {
            device.bus_address = to;
            if device.state.is_attached() {
                device.state = RedirectionState::Bound;
            }
        }
    }

    /// Makes every subsequent call fail with [`DriverError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Queues `script` for the next call of `op`.
    pub fn script(&self, op: HostOp, script: HostScript) {
        self.lock().scripts.entry(op).or_default().push_back(script);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: HostOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn state_of(&self, bus_address: &BusAddress) -> Option<RedirectionState> {
        self.lock()
            .devices
            .iter()
            .find(|d| &d.bus_address == bus_address)
            .map(|d| d.state)
    }

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and runs any scripted behaviour for it.
    async fn enter(&self, op: HostOp, bus: Option<&BusAddress>, force: bool) -> Result<(), DriverError> {
        let script = {
            let mut inner = self.lock();
            inner.calls.push(HostCall {
                op,
                bus: bus.cloned(),
                force,
            });
            if inner.unavailable {
                return Err(DriverError::Unavailable("usbipd service is not running".into()));
            }
            inner.scripts.get_mut(&op).and_then(VecDeque::pop_front)
        };

        match script {
            Some(HostScript::Hang) => std::future::pending().await,
            Some(HostScript::Fail(err)) => Err(err),
            None => Ok(()),
        }
    }

    fn update(
        &self,
        bus: &BusAddress,
        f: impl FnOnce(RedirectionState) -> Result<RedirectionState, DriverError>,
    ) -> Result<(), DriverError> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .iter_mut()
            .find(|d| &d.bus_address == bus)
            .ok_or_else(|| DriverError::Rejected(format!("there is no device with busid '{bus}'")))?;
        device.state = f(device.state)?;
        Ok(())
    }
}

#[async_trait]
impl RedirectionDriver for MockHost {
    async fn list_devices(&self) -> Result<Vec<HostDeviceEntry>, DriverError> {
        self.enter(HostOp::List, None, false).await?;
        Ok(self.lock().devices.clone())
    }

    async fn bind(&self, bus: &BusAddress, force: bool) -> Result<(), DriverError> {
        self.enter(HostOp::Bind, Some(bus), force).await?;
        self.update(bus, |state| {
            Ok(match state {
                RedirectionState::Unbound | RedirectionState::Detached => RedirectionState::Bound,
                other => other,
            })
        })
    }

    async fn attach(&self, bus: &BusAddress) -> Result<(), DriverError> {
        self.enter(HostOp::Attach, Some(bus), false).await?;
        self.update(bus, |state| match state {
            RedirectionState::Bound | RedirectionState::Attached => Ok(RedirectionState::Attached),
            _ => Err(DriverError::Rejected("device is not shared; run bind first".into())),
        })
    }

    async fn detach(&self, bus: &BusAddress) -> Result<(), DriverError> {
        self.enter(HostOp::Detach, Some(bus), false).await?;
        self.update(bus, |state| {
            Ok(match state {
                RedirectionState::Attached => RedirectionState::Bound,
                other => other,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bus(s: &str) -> BusAddress {
        s.parse().expect("valid bus address")
    }

    const CAMERA: UsbId = UsbId::new(0x04b0, 0x0454);

    #[tokio::test]
    async fn test_bind_then_attach_updates_state() {
        // Arrange
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Unbound);

        // Act
        host.bind(&bus("1-4"), false).await.expect("bind");
        host.attach(&bus("1-4")).await.expect("attach");

        // Assert
        assert_eq!(host.state_of(&bus("1-4")), Some(RedirectionState::Attached));
        assert_eq!(host.count(HostOp::Bind), 1);
        assert_eq!(host.count(HostOp::Attach), 1);
    }

    #[tokio::test]
    async fn test_attach_unbound_device_is_rejected() {
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Unbound);
        let result = host.attach(&bus("1-4")).await;
        assert!(matches!(result, Err(DriverError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_scripted_failure_applies_once() {
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound);
        host.script(HostOp::Attach, HostScript::Fail(DriverError::Rejected("busy".into())));

        assert!(host.attach(&bus("1-4")).await.is_err());
        assert!(host.attach(&bus("1-4")).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_hang_never_completes() {
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound);
        host.script(HostOp::Attach, HostScript::Hang);

        let result = tokio::time::timeout(Duration::from_millis(20), host.attach(&bus("1-4"))).await;

        assert!(result.is_err(), "hang should outlive the timeout");
        assert_eq!(host.state_of(&bus("1-4")), Some(RedirectionState::Bound));
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Bound);
        host.set_unavailable(true);
        assert!(matches!(host.list_devices().await, Err(DriverError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_replug_moves_device() {
        let host = MockHost::with_device(CAMERA, bus("1-4"), RedirectionState::Attached);
        host.replug(&bus("1-4"), bus("2-1"));

        let devices = host.list_devices().await.expect("list");
        assert_eq!(devices[0].bus_address, bus("2-1"));
        assert_eq!(devices[0].state, RedirectionState::Bound);
    }
}
