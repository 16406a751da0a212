//! Recovery Coordinator: drives one capture session to a terminal state.
//!
//! # How a session runs (for beginners)
//!
//! Each *attempt* walks four stages in order:
//!
//! ```text
//! Locate ──► Passthrough ──► Probe ──► Capture
//! ```
//!
//! If any stage fails, the attempt is recorded with its failure kind and the
//! [`RecoveryPolicy`] decides what happens next: give up, or retry at the
//! same or a more invasive rung of the escalation ladder after a backoff
//! delay.  The rung never goes down within a session.
//!
//! Before the passthrough stage the rung's recovery action runs:
//!
//! | Rung                 | Extra work                                      |
//! |----------------------|-------------------------------------------------|
//! | `initial`            | none                                            |
//! | `soft_reattach`      | detach first                                    |
//! | `forced_rebind`      | detach, then `bind --force`                     |
//! | `elevated_privilege` | privileged guest access repair after attaching  |
//! | `guest_reset`        | detach, restart the guest, then repair          |
//!
//! # Concurrency
//!
//! Sessions never overlap.  [`RecoveryCoordinator::capture`] waits on a FIFO
//! admission lock; the health monitor uses `try_lock` on the same lock and
//! skips its tick while a session holds it.  With a persistent store both
//! also take the store's [`SessionLock`](crate::infrastructure::storage::session_lock::SessionLock),
//! which extends the same rule across processes: a capture waits for it, a
//! health check skips when it is taken.  [`RecoveryCoordinator::abort_active`]
//! raises a flag that is checked at every stage boundary, during backoff,
//! and continuously while a capture is in flight.

use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tethercam_core::{
    ActiveSession, Artifact, AttemptOutcome, BusAddress, CaptureAttempt, CaptureSession, Device,
    EscalationStep, FailureKind, HealthReport, RecoveryPolicy, RetryDecision, SessionId, SessionState,
    SessionTransitionError, Stage, StageFailure, UsbId,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::capture_image::{CaptureError, CaptureExecutor};
use super::locate_device::DeviceRegistry;
use super::passthrough::PassthroughController;
use super::probe_guest::GuestHealthProber;
use super::session_store::SessionStateStore;
use crate::infrastructure::guest::{GuestCamera, GuestDriver};
use crate::infrastructure::process::DriverError;
use crate::infrastructure::redirection::RedirectionDriver;
use crate::infrastructure::storage::session_lock::{LockError, SessionLockGuard};

/// What the coordinator captures from, and how hard it tries.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub device_id: UsbId,
    /// Preferred bus address when several devices share `device_id`.
    pub bus_hint: Option<BusAddress>,
    pub policy: RecoveryPolicy,
}

/// Why a capture request did not produce an artifact.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Refused before a session was created; no attempts were made.
    #[error("capture request rejected: {0}")]
    Rejected(StageFailure),
    #[error(
        "capture session {} failed after {} attempt(s): {}",
        .session.id(),
        .session.attempts().len(),
        .kind
    )]
    Failed {
        kind: FailureKind,
        session: Box<CaptureSession>,
    },
    #[error("capture session {} aborted", .session.id())]
    Aborted { session: Box<CaptureSession> },
    #[error(transparent)]
    Transition(#[from] SessionTransitionError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl SessionError {
    /// The failure kind surfaced to the caller, if any.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Rejected(failure) => Some(failure.kind),
            Self::Failed { kind, .. } => Some(*kind),
            Self::Aborted { .. } | Self::Transition(_) | Self::Lock(_) => None,
        }
    }

    /// The terminal session, with its full attempt history.
    pub fn session(&self) -> Option<&CaptureSession> {
        match self {
            Self::Failed { session, .. } | Self::Aborted { session } => Some(&**session),
            Self::Rejected(_) | Self::Transition(_) | Self::Lock(_) => None,
        }
    }
}

/// How an attempt ended early.
enum Interrupt {
    Failed(StageFailure),
    Aborted,
}

impl From<StageFailure> for Interrupt {
    fn from(failure: StageFailure) -> Self {
        Self::Failed(failure)
    }
}

impl From<CaptureError> for Interrupt {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Failed(failure) => Self::Failed(failure),
            CaptureError::Aborted => Self::Aborted,
        }
    }
}

/// Receiving side of a session's abort flag.
struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is raised; never resolves if it cannot be.
    async fn raised(&mut self) {
        let closed = self.0.wait_for(|raised| *raised).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `delay`; returns `true` if the flag was raised meanwhile.
    async fn sleep(&mut self, delay: Duration) -> bool {
        if self.is_raised() {
            return true;
        }
        let interrupted = tokio::select! {
            _ = time::sleep(delay) => false,
            _ = self.raised() => true,
        };
        interrupted || self.is_raised()
    }
}

/// Publishes a session's abort sender and withdraws it on drop, including
/// when the capture future is dropped mid-session.
struct AbortRegistration<'a> {
    slot: &'a std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl<'a> AbortRegistration<'a> {
    fn install(slot: &'a std::sync::Mutex<Option<watch::Sender<bool>>>, tx: watch::Sender<bool>) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Self { slot }
    }
}

impl Drop for AbortRegistration<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Supervises capture sessions end to end.
pub struct RecoveryCoordinator {
    device_id: UsbId,
    policy: RecoveryPolicy,
    registry: Mutex<DeviceRegistry>,
    passthrough: PassthroughController,
    prober: GuestHealthProber,
    executor: CaptureExecutor,
    guest: Arc<dyn GuestDriver>,
    store: SessionStateStore,
    admission: Mutex<()>,
    abort: std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl RecoveryCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        host: Arc<dyn RedirectionDriver>,
        guest: Arc<dyn GuestDriver>,
        store: SessionStateStore,
    ) -> Self {
        let timeouts = *settings.policy.timeouts();
        Self {
            device_id: settings.device_id,
            registry: Mutex::new(DeviceRegistry::new(host.clone(), settings.bus_hint)),
            passthrough: PassthroughController::new(host, timeouts.passthrough),
            prober: GuestHealthProber::new(guest.clone(), timeouts.probe),
            executor: CaptureExecutor::new(guest.clone()),
            guest,
            policy: settings.policy,
            store,
            admission: Mutex::new(()),
            abort: std::sync::Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Snapshot of device, session, and health state.
    pub fn status(&self) -> SessionState {
        self.store.snapshot()
    }

    /// Runs one capture session writing to `output_path`.
    ///
    /// Waits for any running session to finish first, in this process or,
    /// with a persistent store, in another one.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Rejected`] (`OutputCollision`) when `output_path`
    ///   already exists; no session is created.
    /// - [`SessionError::Failed`] once the policy gives up.
    /// - [`SessionError::Aborted`] after [`abort_active`](Self::abort_active),
    ///   including while still waiting for another session.
    /// - [`SessionError::Lock`] when the session lock file is unusable.
    pub async fn capture(&self, output_path: impl Into<PathBuf>) -> Result<CaptureSession, SessionError> {
        let output_path = output_path.into();
        if tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            warn!("refusing capture: {} already exists", output_path.display());
            return Err(SessionError::Rejected(StageFailure::new(
                FailureKind::OutputCollision,
                format!("{} already exists", output_path.display()),
            )));
        }

        let _admission = self.admission.lock().await;
        let (abort_tx, abort_rx) = watch::channel(false);
        let _registration = AbortRegistration::install(&self.abort, abort_tx);
        let mut abort = AbortSignal(abort_rx);
        let mut session = CaptureSession::new(output_path);

        let _held = match self.store.session_lock() {
            Some(lock) => {
                let held = tokio::select! {
                    held = lock.acquire() => held?,
                    _ = abort.raised() => {
                        // Nothing was published yet; the state file belongs
                        // to whoever holds the lock.
                        session.abort()?;
                        info!(session = %session.id(), "capture aborted while waiting for the camera");
                        return Err(SessionError::Aborted {
                            session: Box::new(session),
                        });
                    }
                };
                self.store.resync();
                Some(held)
            }
            None => None,
        };

        self.run_session(session, abort).await
    }

    /// Asks the running session, if any, to stop.  Returns `false` when no
    /// session is running.
    pub fn abort_active(&self) -> bool {
        match self.abort_slot().as_ref() {
            Some(tx) => {
                tx.send_replace(true);
                info!("abort requested for active capture session");
                true
            }
            None => false,
        }
    }

    /// One supervisory health check, skipped (returning `None`) while a
    /// session holds the pipeline.
    ///
    /// With `auto_repair`, an unhealthy link is re-established (locate,
    /// bind, attach) and checked once more.
    pub async fn health_check(&self, auto_repair: bool) -> Option<HealthReport> {
        let Ok(_admission) = self.admission.try_lock() else {
            debug!("capture session in progress; skipping health check");
            return None;
        };
        let _held = self.try_session_lock()?;

        let mut report = match self.check_link().await {
            Ok(camera) => healthy_report(&camera, false),
            Err(failure) => unhealthy_report(&failure),
        };

        if !report.healthy && auto_repair {
            info!("health check failed ({}); re-establishing passthrough", report.detail);
            match self.relink().await {
                Ok(()) => match self.check_link().await {
                    Ok(camera) => report = healthy_report(&camera, true),
                    Err(failure) => report = unhealthy_report(&failure),
                },
                Err(failure) => {
                    report.detail = format!("{}; repair failed: {failure}", report.detail);
                }
            }
        }

        self.store.record_health(report.clone());
        Some(report)
    }

    /// `Some(guard)` when the cross-process lock was free (or there is none
    /// to take), `None` when another process is mid-session.
    fn try_session_lock(&self) -> Option<Option<SessionLockGuard>> {
        let lock = match self.store.session_lock() {
            Some(lock) => lock,
            None => return Some(None),
        };
        match lock.try_acquire() {
            Ok(Some(held)) => {
                self.store.resync();
                Some(Some(held))
            }
            Ok(None) => {
                debug!("capture session in progress in another process; skipping health check");
                None
            }
            Err(e) => {
                warn!("skipping health check: {e}");
                None
            }
        }
    }

    fn abort_slot(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_session(
        &self,
        mut session: CaptureSession,
        mut abort: AbortSignal,
    ) -> Result<CaptureSession, SessionError> {
        let id = session.id();
        info!(session = %id, output = %session.output_path().display(), "capture session started");
        self.store.begin_session(&session);
        let mut rung = 0usize;

        loop {
            let sequence = session.next_sequence();
            let step = self.policy.step(rung);
            let started_at = SystemTime::now();
            let clock = Instant::now();
            let mut stage = Stage::Locate;

            let outcome = self
                .run_attempt(&session, sequence, step, &mut stage, &mut abort)
                .await;

            let failure = match outcome {
                Ok(artifact) => {
                    session.record_attempt(CaptureAttempt {
                        sequence,
                        stage,
                        escalation: step,
                        outcome: AttemptOutcome::Success,
                        started_at,
                        duration: clock.elapsed(),
                    })?;
                    session.succeed(artifact)?;
                    info!(session = %id, attempt = sequence, "capture session succeeded");
                    self.store.finish_session(&session);
                    return Ok(session);
                }
                Err(Interrupt::Aborted) => return self.abort_session(session, stage),
                Err(Interrupt::Failed(failure)) => failure,
            };

            let kind = failure.kind;
            warn!(
                session = %id,
                attempt = sequence,
                stage = %stage,
                kind = %kind,
                escalation = %step,
                "attempt failed: {}",
                failure.detail
            );
            session.record_attempt(CaptureAttempt {
                sequence,
                stage,
                escalation: step,
                outcome: AttemptOutcome::Failure(failure),
                started_at,
                duration: clock.elapsed(),
            })?;
            self.store.update_session(&session);

            match self.policy.decide(session.attempts().len() as u32, rung, kind) {
                RetryDecision::GiveUp => {
                    session.fail(kind)?;
                    error!(
                        session = %id,
                        attempts = session.attempts().len(),
                        kind = %kind,
                        "capture session failed"
                    );
                    self.store.finish_session(&session);
                    return Err(SessionError::Failed {
                        kind,
                        session: Box::new(session),
                    });
                }
                RetryDecision::Retry { rung: next, delay } => {
                    info!(
                        session = %id,
                        next_attempt = session.next_sequence(),
                        escalation = %self.policy.step(next),
                        "retrying after {delay:?}"
                    );
                    self.store.set_active(ActiveSession {
                        id,
                        attempt: session.next_sequence(),
                        stage: None,
                    });
                    if abort.sleep(delay).await {
                        return self.abort_session(session, stage);
                    }
                    rung = next;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        session: &CaptureSession,
        sequence: u32,
        step: EscalationStep,
        stage: &mut Stage,
        abort: &mut AbortSignal,
    ) -> Result<Artifact, Interrupt> {
        let timeouts = *self.policy.timeouts();
        let id = session.id();

        self.enter(id, sequence, Stage::Locate, stage, abort)?;
        let mut device = self
            .registry
            .lock()
            .await
            .locate(self.device_id, timeouts.locate)
            .await?;
        self.store.update_device(&device);

        self.enter(id, sequence, Stage::Passthrough, stage, abort)?;
        let prepared = self.prepare_passthrough(&mut device, step).await;
        self.store.update_device(&device);
        prepared?;

        self.enter(id, sequence, Stage::Probe, stage, abort)?;
        let camera = self.prober.probe().await.into_result()?;

        self.enter(id, sequence, Stage::Capture, stage, abort)?;
        let port = Some(camera.port.as_str()).filter(|p| !p.is_empty());
        let artifact = self
            .executor
            .capture(session.output_path(), timeouts.capture, port, abort.raised())
            .await?;
        Ok(artifact)
    }

    /// Stage boundary: honours a pending abort and publishes progress.
    fn enter(
        &self,
        id: SessionId,
        sequence: u32,
        next: Stage,
        stage: &mut Stage,
        abort: &AbortSignal,
    ) -> Result<(), Interrupt> {
        if abort.is_raised() {
            return Err(Interrupt::Aborted);
        }
        *stage = next;
        debug!(session = %id, attempt = sequence, stage = %next, "entering stage");
        self.store.set_active(ActiveSession {
            id,
            attempt: sequence,
            stage: Some(next),
        });
        Ok(())
    }

    /// Applies the rung's recovery action and brings the device to `Attached`.
    async fn prepare_passthrough(&self, device: &mut Device, step: EscalationStep) -> Result<(), StageFailure> {
        if step.detaches_first() {
            self.passthrough.detach(device).await?;
        }
        match step {
            EscalationStep::ForcedRebind => self.passthrough.force_rebind(device).await?,
            EscalationStep::GuestReset => self.restart_guest().await?,
            _ => {}
        }
        self.passthrough.ensure_attached(device).await?;
        if step.is_elevated() {
            self.repair_guest_access().await;
        }
        Ok(())
    }

    async fn restart_guest(&self) -> Result<(), StageFailure> {
        let limit = self.policy.timeouts().passthrough;
        match time::timeout(limit, self.guest.restart()).await {
            Ok(Ok(())) => {
                info!("guest restarted");
                Ok(())
            }
            Ok(Err(err)) => Err(StageFailure::new(
                FailureKind::Unreachable,
                format!("guest restart failed: {err}"),
            )),
            Err(_) => Err(StageFailure::new(
                FailureKind::Unreachable,
                format!("guest restart did not finish within {limit:?}"),
            )),
        }
    }

    /// Best effort; the probe that follows reports whether it helped.
    async fn repair_guest_access(&self) {
        let limit = self.policy.timeouts().passthrough;
        match time::timeout(limit, self.guest.repair_access()).await {
            Ok(Ok(())) => debug!("privileged guest access repair done"),
            Ok(Err(DriverError::PermissionDenied(detail))) => {
                warn!("privileged repair not permitted: {detail}")
            }
            Ok(Err(err)) => warn!("privileged repair failed: {err}"),
            Err(_) => warn!("privileged repair did not finish within {limit:?}"),
        }
    }

    fn abort_session(&self, mut session: CaptureSession, stage: Stage) -> Result<CaptureSession, SessionError> {
        session.abort()?;
        info!(session = %session.id(), stage = %stage, "capture session aborted");
        self.store.finish_session(&session);
        Err(SessionError::Aborted {
            session: Box::new(session),
        })
    }

    /// Locates the device, checks it is attached, and probes the guest.
    async fn check_link(&self) -> Result<GuestCamera, StageFailure> {
        let timeouts = *self.policy.timeouts();
        let device = self
            .registry
            .lock()
            .await
            .locate(self.device_id, timeouts.locate)
            .await?;
        self.store.update_device(&device);
        if !device.state.is_attached() {
            return Err(StageFailure::new(
                FailureKind::InvalidState,
                format!("{} is {}, not attached", device.bus_address, device.state),
            ));
        }
        self.prober.probe().await.into_result()
    }

    async fn relink(&self) -> Result<(), StageFailure> {
        let timeouts = *self.policy.timeouts();
        let mut device = self
            .registry
            .lock()
            .await
            .locate(self.device_id, timeouts.locate)
            .await?;
        let result = self.passthrough.ensure_attached(&mut device).await;
        self.store.update_device(&device);
        result
    }
}

fn healthy_report(camera: &GuestCamera, repaired: bool) -> HealthReport {
    HealthReport {
        checked_at: SystemTime::now(),
        healthy: true,
        failure: None,
        detail: format!("{} on {}", camera.model, camera.port),
        repaired,
    }
}

fn unhealthy_report(failure: &StageFailure) -> HealthReport {
    HealthReport {
        checked_at: SystemTime::now(),
        healthy: false,
        failure: Some(failure.kind),
        detail: failure.detail.clone(),
        repaired: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::guest::MockGuestDriver;
    use crate::infrastructure::redirection::mock::MockHost;
    use tethercam_core::{BackoffSchedule, RedirectionState, SessionStatus, StageTimeouts};

    const CAMERA: UsbId = UsbId::new(0x04b0, 0x0454);

    fn policy(max_attempts: u32) -> RecoveryPolicy {
        let timeouts = StageTimeouts {
            locate: Duration::from_millis(100),
            passthrough: Duration::from_millis(100),
            probe: Duration::from_millis(100),
            capture: Duration::from_millis(200),
        };
        RecoveryPolicy::new(
            max_attempts,
            timeouts,
            vec![EscalationStep::Initial, EscalationStep::SoftReattach],
            BackoffSchedule::none(),
        )
        .expect("valid policy")
    }

    fn coordinator(guest: MockGuestDriver, max_attempts: u32) -> RecoveryCoordinator {
        let bus: BusAddress = "1-4".parse().expect("valid bus address");
        let host = Arc::new(MockHost::with_device(CAMERA, bus, RedirectionState::Bound));
        RecoveryCoordinator::new(
            CoordinatorSettings {
                device_id: CAMERA,
                bus_hint: None,
                policy: policy(max_attempts),
            },
            host,
            Arc::new(guest),
            SessionStateStore::in_memory(),
        )
    }

    fn temp_output() -> PathBuf {
        std::env::temp_dir().join(format!("tethercam_recover_{}.jpg", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_unreachable_guest_exhausts_attempts() {
        // Arrange
        let mut guest = MockGuestDriver::new();
        guest
            .expect_list_cameras()
            .times(3)
            .returning(|_| Ok(vec![]));
        guest.expect_capture().never();
        let coordinator = coordinator(guest, 3);

        // Act
        let err = coordinator.capture(temp_output()).await.unwrap_err();

        // Assert
        assert_eq!(err.kind(), Some(FailureKind::Unreachable));
        let session = err.session().expect("session");
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.attempts().len(), 3);
        assert!(session.attempts().iter().all(|a| a.stage == Stage::Probe));
    }

    #[tokio::test]
    async fn test_status_reflects_finished_session() {
        let mut guest = MockGuestDriver::new();
        guest.expect_list_cameras().returning(|_| Ok(vec![]));
        let coordinator = coordinator(guest, 1);

        let _ = coordinator.capture(temp_output()).await;

        let status = coordinator.status();
        assert!(status.active.is_none());
        let last = status.last_session.expect("last session");
        assert_eq!(last.status, SessionStatus::Failed);
        assert_eq!(last.terminal_error, Some(FailureKind::Unreachable));
        assert_eq!(
            status.device.map(|d| d.state),
            Some(RedirectionState::Attached)
        );
    }

    #[tokio::test]
    async fn test_abort_without_active_session_returns_false() {
        let coordinator = coordinator(MockGuestDriver::new(), 1);
        assert!(!coordinator.abort_active());
    }

    #[tokio::test]
    async fn test_abort_signal_sleep_returns_early_when_raised() {
        let (tx, rx) = watch::channel(false);
        let mut signal = AbortSignal(rx);
        tx.send_replace(true);

        let started = Instant::now();
        assert!(signal.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_abort_signal_sleep_completes_without_abort() {
        let (_tx, rx) = watch::channel(false);
        let mut signal = AbortSignal(rx);
        assert!(!signal.sleep(Duration::from_millis(5)).await);
    }
}
