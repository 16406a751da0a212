//! Supervisory health monitor.
//!
//! While no capture session is running, periodically checks that the camera
//! is still attached and visible in the guest, so a dropped link is noticed
//! (and optionally repaired) before the next capture request arrives.  Ticks
//! that land while a session holds the pipeline are skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tethercam_core::HealthReport;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::recover::RecoveryCoordinator;

/// Monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// Re-establish the passthrough link when a check fails.
    pub auto_repair: bool,
}

/// Periodic health checker bound to one coordinator.
pub struct HealthMonitor {
    coordinator: Arc<RecoveryCoordinator>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(coordinator: Arc<RecoveryCoordinator>, config: HealthMonitorConfig) -> Self {
        Self { coordinator, config }
    }

    /// Spawns the check loop; it runs until `running` is cleared.
    ///
    /// Every completed check is also sent on the returned channel.  The loop
    /// keeps running if the receiver is dropped.
    pub fn start(self: Arc<Self>, running: Arc<AtomicBool>) -> mpsc::Receiver<HealthReport> {
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut ticker = time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("health monitor started (every {:?})", self.config.interval);

            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                match self.coordinator.health_check(self.config.auto_repair).await {
                    None => debug!("health check skipped"),
                    Some(report) => {
                        if report.healthy {
                            debug!("camera healthy: {}", report.detail);
                        } else {
                            warn!("camera unhealthy: {}", report.detail);
                        }
                        let _ = tx.try_send(report);
                    }
                }
            }
            info!("health monitor stopped");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::recover::CoordinatorSettings;
    use crate::application::session_store::SessionStateStore;
    use crate::infrastructure::guest::mock::MockGuest;
    use crate::infrastructure::redirection::mock::MockHost;
    use tethercam_core::{BusAddress, FailureKind, RecoveryPolicy, RedirectionState, UsbId};

    const CAMERA: UsbId = UsbId::new(0x04b0, 0x0454);

    fn coordinator(host: Arc<MockHost>, guest: Arc<MockGuest>) -> Arc<RecoveryCoordinator> {
        Arc::new(RecoveryCoordinator::new(
            CoordinatorSettings {
                device_id: CAMERA,
                bus_hint: None,
                policy: RecoveryPolicy::default(),
            },
            host,
            guest,
            SessionStateStore::in_memory(),
        ))
    }

    fn bus() -> BusAddress {
        "1-4".parse().expect("valid bus address")
    }

    #[tokio::test]
    async fn test_monitor_reports_healthy_attached_camera() {
        // Arrange
        let host = Arc::new(MockHost::with_device(CAMERA, bus(), RedirectionState::Attached));
        let coordinator = coordinator(host, Arc::new(MockGuest::new()));
        let monitor = Arc::new(HealthMonitor::new(
            coordinator.clone(),
            HealthMonitorConfig {
                interval: Duration::from_millis(10),
                auto_repair: false,
            },
        ));
        let running = Arc::new(AtomicBool::new(true));

        // Act
        let mut reports = monitor.start(running.clone());
        let report = time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("report in time")
            .expect("channel open");
        running.store(false, Ordering::Relaxed);

        // Assert
        assert!(report.healthy);
        assert_eq!(coordinator.status().last_health.map(|h| h.healthy), Some(true));
    }

    #[tokio::test]
    async fn test_monitor_repairs_dropped_link() {
        // Arrange: camera is only bound, not attached
        let host = Arc::new(MockHost::with_device(CAMERA, bus(), RedirectionState::Bound));
        let coordinator = coordinator(host.clone(), Arc::new(MockGuest::new()));

        // Act
        let report = coordinator.health_check(true).await.expect("not skipped");

        // Assert
        assert!(report.healthy);
        assert!(report.repaired);
        assert_eq!(host.state_of(&bus()), Some(RedirectionState::Attached));
    }

    #[tokio::test]
    async fn test_health_check_without_repair_reports_failure() {
        let host = Arc::new(MockHost::with_device(CAMERA, bus(), RedirectionState::Bound));
        let coordinator = coordinator(host.clone(), Arc::new(MockGuest::new()));

        let report = coordinator.health_check(false).await.expect("not skipped");

        assert!(!report.healthy);
        assert_eq!(report.failure, Some(FailureKind::InvalidState));
        assert_eq!(host.state_of(&bus()), Some(RedirectionState::Bound));
    }
}
