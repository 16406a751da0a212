//! Passthrough Controller: moves the camera across the host/guest boundary.
//!
//! ```text
//! Unbound --bind--> Bound --attach--> Attached --detach--> Detached
//!                     ^                                        |
//!                     +------------------bind------------------+
//! ```
//!
//! Every transition is idempotent: asking for a state the device is already
//! in succeeds without touching the host tool, except `attach` on an
//! attached device, which re-queries the host to make sure the link is still
//! alive.  Every driver call is bounded by the same per-transition timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tethercam_core::{Device, FailureKind, InvalidTransition, RedirectionState, StageFailure, Transition};
use tokio::time;
use tracing::{debug, info, warn};

use crate::infrastructure::process::DriverError;
use crate::infrastructure::redirection::RedirectionDriver;

/// Drives a [`Device`] through its redirection states.
pub struct PassthroughController {
    driver: Arc<dyn RedirectionDriver>,
    transition_timeout: Duration,
}

impl PassthroughController {
    pub fn new(driver: Arc<dyn RedirectionDriver>, transition_timeout: Duration) -> Self {
        Self {
            driver,
            transition_timeout,
        }
    }

    /// Makes the device shareable.  A no-op on `Bound` and `Attached`.
    pub async fn bind(&self, device: &mut Device) -> Result<(), StageFailure> {
        if device.state.is_noop(Transition::Bind) {
            debug!("{} already bound", device.bus_address);
            return Ok(());
        }
        let bus = device.bus_address.clone();
        self.call(Transition::Bind, self.driver.bind(&bus, false)).await?;
        device.apply(Transition::Bind).map_err(invalid_state)?;
        info!("bound {bus}");
        Ok(())
    }

    /// Re-shares the device, overriding any conflicting host driver claim.
    pub async fn force_rebind(&self, device: &mut Device) -> Result<(), StageFailure> {
        let bus = device.bus_address.clone();
        self.call(Transition::Bind, self.driver.bind(&bus, true)).await?;
        device.apply(Transition::Bind).map_err(invalid_state)?;
        info!("force-bound {bus}");
        Ok(())
    }

    /// Hands the device to the guest.
    ///
    /// # Errors
    ///
    /// [`FailureKind::InvalidState`] when the device is `Unbound` or
    /// `Detached`; the host tool is not invoked in that case.
    pub async fn attach(&self, device: &mut Device) -> Result<(), StageFailure> {
        let bus = device.bus_address.clone();

        if device.state.is_attached() {
            match self.observe(device).await? {
                RedirectionState::Attached => {
                    debug!("{bus} already attached and live");
                    return Ok(());
                }
                observed => {
                    warn!("{bus} link dropped; host reports {observed}");
                    device.state = observed;
                }
            }
        }

        let next = device.state.apply(Transition::Attach).map_err(invalid_state)?;
        self.call(Transition::Attach, self.driver.attach(&bus)).await?;
        device.state = next;
        info!("attached {bus}");
        Ok(())
    }

    /// Takes the device back from the guest.
    ///
    /// Tool-level refusals are logged and treated as success; only an
    /// unavailable redirection facility or a timeout is reported.
    pub async fn detach(&self, device: &mut Device) -> Result<(), StageFailure> {
        let bus = device.bus_address.clone();
        match time::timeout(self.transition_timeout, self.driver.detach(&bus)).await {
            Err(_) => return Err(timed_out(Transition::Detach, self.transition_timeout)),
            Ok(Err(DriverError::Unavailable(detail))) => {
                return Err(StageFailure::new(FailureKind::RedirectionMechanismUnreachable, detail))
            }
            Ok(Err(err)) => warn!("detach of {bus} reported {err}; treating as detached"),
            Ok(Ok(())) => info!("detached {bus}"),
        }
        // Detach is valid from every state.
        device.state = RedirectionState::Detached;
        Ok(())
    }

    /// Walks the device to `Attached`, binding first if needed.
    pub async fn ensure_attached(&self, device: &mut Device) -> Result<(), StageFailure> {
        if !device.state.is_attached() {
            self.bind(device).await?;
        }
        self.attach(device).await
    }

    /// Re-reads the device's state from the host listing.
    async fn observe(&self, device: &Device) -> Result<RedirectionState, StageFailure> {
        let entries = match time::timeout(self.transition_timeout, self.driver.list_devices()).await {
            Err(_) => return Err(timed_out(Transition::Attach, self.transition_timeout)),
            Ok(result) => result.map_err(driver_failure)?,
        };
        entries
            .into_iter()
            .find(|e| e.bus_address == device.bus_address && e.id == device.id)
            .map(|e| e.state)
            .ok_or_else(|| {
                StageFailure::new(
                    FailureKind::DeviceNotFound,
                    format!("{} disappeared from the host listing", device.bus_address),
                )
            })
    }

    async fn call<F>(&self, transition: Transition, op: F) -> Result<(), StageFailure>
    where
        F: Future<Output = Result<(), DriverError>>,
    {
        match time::timeout(self.transition_timeout, op).await {
            Err(_) => Err(timed_out(transition, self.transition_timeout)),
            Ok(result) => result.map_err(driver_failure),
        }
    }
}

fn timed_out(transition: Transition, after: Duration) -> StageFailure {
    StageFailure::new(
        FailureKind::PassthroughTimeout,
        format!("{transition} did not complete within {after:?}"),
    )
}

fn invalid_state(err: InvalidTransition) -> StageFailure {
    StageFailure::new(FailureKind::InvalidState, err.to_string())
}

fn driver_failure(err: DriverError) -> StageFailure {
    match err {
        DriverError::Unavailable(detail) => {
            StageFailure::new(FailureKind::RedirectionMechanismUnreachable, detail)
        }
        DriverError::Timeout(after) => StageFailure::new(
            FailureKind::PassthroughTimeout,
            format!("host tool timed out after {after:?}"),
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
    use tethercam_core::{BusAddress, UsbId};

    const CAMERA: UsbId = UsbId::new(0x04b0, 0x0454);
    const TIMEOUT: Duration = Duration::from_millis(100);

    fn bus() -> BusAddress {
        "1-4".parse().expect("valid bus address")
    }

    fn setup(state: RedirectionState) -> (Arc<MockHost>, PassthroughController, Device) {
        let host = Arc::new(MockHost::with_device(CAMERA, bus(), state));
        let controller = PassthroughController::new(host.clone(), TIMEOUT);
        (host, controller, Device::new(CAMERA, bus(), state))
    }

    #[tokio::test]
    async fn test_ensure_attached_from_unbound_binds_then_attaches() {
        // Arrange
        let (host, controller, mut device) = setup(RedirectionState::Unbound);

        // Act
        controller.ensure_attached(&mut device).await.expect("attached");

        // Assert
        assert_eq!(device.state, RedirectionState::Attached);
        let ops: Vec<HostOp> = host.calls().iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![HostOp::Bind, HostOp::Attach]);
    }

    #[tokio::test]
    async fn test_bind_on_bound_is_noop() {
        let (host, controller, mut device) = setup(RedirectionState::Bound);

        controller.bind(&mut device).await.expect("bind");

        assert_eq!(device.state, RedirectionState::Bound);
        assert_eq!(host.count(HostOp::Bind), 0);
    }

    #[tokio::test]
    async fn test_bind_on_attached_is_noop() {
        let (host, controller, mut device) = setup(RedirectionState::Attached);

        controller.bind(&mut device).await.expect("bind");

        assert_eq!(device.state, RedirectionState::Attached);
        assert_eq!(host.count(HostOp::Bind), 0);
    }

    #[tokio::test]
    async fn test_attach_on_live_attached_only_requeries() {
        let (host, controller, mut device) = setup(RedirectionState::Attached);

        controller.attach(&mut device).await.expect("attach");

        assert_eq!(device.state, RedirectionState::Attached);
        assert_eq!(host.count(HostOp::List), 1);
        assert_eq!(host.count(HostOp::Attach), 0);
    }

    #[tokio::test]
    async fn test_attach_on_dropped_link_reattaches() {
        // Arrange: we believe it is attached, the host says only bound
        let (host, controller, _) = setup(RedirectionState::Bound);
        let mut device = Device::new(CAMERA, bus(), RedirectionState::Attached);

        // Act
        controller.attach(&mut device).await.expect("attach");

        // Assert
        assert_eq!(device.state, RedirectionState::Attached);
        assert_eq!(host.count(HostOp::Attach), 1);
    }

    #[tokio::test]
    async fn test_attach_from_unbound_is_invalid_state() {
        let (host, controller, mut device) = setup(RedirectionState::Unbound);

        let err = controller.attach(&mut device).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::InvalidState);
        assert_eq!(host.count(HostOp::Attach), 0);
    }

    #[tokio::test]
    async fn test_attach_from_detached_is_invalid_state() {
        let (_host, controller, mut device) = setup(RedirectionState::Attached);
        controller.detach(&mut device).await.expect("detach");

        let err = controller.attach(&mut device).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::InvalidState);
        assert_eq!(device.state, RedirectionState::Detached);
    }

    #[tokio::test]
    async fn test_detach_then_bind_then_attach() {
        let (_host, controller, mut device) = setup(RedirectionState::Attached);

        controller.detach(&mut device).await.expect("detach");
        controller.ensure_attached(&mut device).await.expect("reattach");

        assert_eq!(device.state, RedirectionState::Attached);
    }

    #[tokio::test]
    async fn test_attach_hang_is_passthrough_timeout() {
        let (host, controller, mut device) = setup(RedirectionState::Bound);
        host.script(HostOp::Attach, HostScript::Hang);

        let err = controller.attach(&mut device).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::PassthroughTimeout);
        assert_eq!(device.state, RedirectionState::Bound);
    }

    #[tokio::test]
    async fn test_detach_tolerates_tool_rejection() {
        let (host, controller, mut device) = setup(RedirectionState::Attached);
        host.script(HostOp::Detach, HostScript::Fail(DriverError::Rejected("busy".into())));

        controller.detach(&mut device).await.expect("detach still succeeds");

        assert_eq!(device.state, RedirectionState::Detached);
    }

    #[tokio::test]
    async fn test_detach_without_mechanism_is_fatal() {
        let (host, controller, mut device) = setup(RedirectionState::Attached);
        host.set_unavailable(true);

        let err = controller.detach(&mut device).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::RedirectionMechanismUnreachable);
    }

    #[tokio::test]
    async fn test_rejected_attach_is_passthrough_rejected() {
        let (host, controller, mut device) = setup(RedirectionState::Bound);
        host.script(
            HostOp::Attach,
            HostScript::Fail(DriverError::Rejected("device is in use".into())),
        );

        let err = controller.attach(&mut device).await.unwrap_err();

        assert_eq!(err.kind, FailureKind::PassthroughRejected);
    }

    #[tokio::test]
    async fn test_force_rebind_passes_force_flag() {
        let (host, controller, mut device) = setup(RedirectionState::Bound);
        controller.detach(&mut device).await.expect("detach");

        controller.force_rebind(&mut device).await.expect("rebind");

        assert_eq!(device.state, RedirectionState::Bound);
        let bind = host
            .calls()
            .into_iter()
            .find(|c| c.op == HostOp::Bind)
            .expect("bind call");
        assert!(bind.force);
    }
}
