//! Scriptable in-memory [`GuestDriver`] for tests.
//!
//! [`MockGuest`] answers camera listings from a configurable table and
//! performs captures by writing bytes directly to the host path, so the
//! capture executor's artifact validation runs against real files.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{GuestCamera, GuestDriver};
use crate::infrastructure::process::{DriverError, ToolOutput};

/// Bytes written by a default successful capture (a JPEG SOI/EOI pair).
pub const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0xFF, 0xD9];

/// Recorded guest operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestOp {
    ListUnprivileged,
    ListPrivileged,
    Capture,
    Terminate,
    RepairAccess,
    Restart,
}

/// What the next capture call does.
#[derive(Debug, Clone)]
pub enum CaptureScript {
    /// Writes the bytes and exits 0.
    WriteImage(Vec<u8>),
    /// Exits 0 without creating a file.
    ReportSuccessWithoutFile,
    /// Creates a zero-byte file and exits 0.
    WriteEmptyFile,
    /// Exits non-zero with the given stderr.
    ExitWith { code: i32, stderr: String },
    /// Writes the bytes, then never completes.
    HangAfterPartialWrite(Vec<u8>),
    /// Sleeps before writing the bytes and exiting 0.
    WriteImageAfter(std::time::Duration, Vec<u8>),
    Fail(DriverError),
}

/// What the next listing call does.
#[derive(Debug, Clone)]
pub enum ListScript {
    Cameras(Vec<GuestCamera>),
    Fail(DriverError),
    Hang,
}

#[derive(Debug)]
struct GuestInner {
    cameras: Vec<GuestCamera>,
    deny_unprivileged: bool,
    repair_grants_access: bool,
    unavailable: bool,
    unprivileged_lists: VecDeque<ListScript>,
    privileged_lists: VecDeque<ListScript>,
    captures: VecDeque<CaptureScript>,
    default_capture: CaptureScript,
    calls: Vec<GuestOp>,
}

/// In-memory stand-in for the guest capture facility.
#[derive(Debug)]
pub struct MockGuest {
    inner: Mutex<GuestInner>,
    capture_started: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGuest {
    /// One USB camera, unprivileged access allowed, captures succeed.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuestInner {
                cameras: vec![GuestCamera::new("Nikon DSC Z6_3", "usb:001,004")],
                deny_unprivileged: false,
                repair_grants_access: false,
                unavailable: false,
                unprivileged_lists: VecDeque::new(),
                privileged_lists: VecDeque::new(),
                captures: VecDeque::new(),
                default_capture: CaptureScript::WriteImage(FAKE_JPEG.to_vec()),
                calls: Vec::new(),
            }),
            capture_started: Notify::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_cameras(&self, cameras: Vec<GuestCamera>) {
        self.lock().cameras = cameras;
    }

    /// When set, unprivileged listings fail with a claim error while
    /// privileged ones still see the camera.
    pub fn deny_unprivileged(&self, deny: bool) {
        self.lock().deny_unprivileged = deny;
    }

    /// When set, a successful `repair_access` clears `deny_unprivileged`.
    pub fn repair_grants_access(&self, grants: bool) {
        self.lock().repair_grants_access = grants;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn script_list(&self, privileged: bool, script: ListScript) {
        let mut inner = self.lock();
        if privileged {
            inner.privileged_lists.push_back(script);
        } else {
            inner.unprivileged_lists.push_back(script);
        }
    }

    /// Queues `script` for the next capture call.
    pub fn script_capture(&self, script: CaptureScript) {
        self.lock().captures.push_back(script);
    }

    /// Behaviour for captures with nothing queued.
    pub fn set_default_capture(&self, script: CaptureScript) {
        self.lock().default_capture = script;
    }

    /// Notified once a capture has produced its (possibly partial) output.
    pub fn capture_started(&self) -> &Notify {
        &self.capture_started
    }

    /// Highest number of captures that were ever running at the same time.
    pub fn max_concurrent_captures(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<GuestOp> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: GuestOp) -> usize {
        self.lock().calls.iter().filter(|&&c| c == op).count()
    }

    fn lock(&self) -> MutexGuard<'_, GuestInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: GuestOp) -> Result<(), DriverError> {
        let mut inner = self.lock();
        inner.calls.push(op);
        if inner.unavailable {
            return Err(DriverError::Unavailable("guest is not running".into()));
        }
        Ok(())
    }

    async fn run_capture(&self, target: &Path, script: CaptureScript) -> Result<ToolOutput, DriverError> {
        let write = |bytes: Vec<u8>| async move {
            tokio::fs::write(target, bytes)
                .await
                .map_err(|e| DriverError::Rejected(format!("mock capture write failed: {e}")))
        };

        match script {
            CaptureScript::WriteImage(bytes) => {
                write(bytes).await?;
                self.capture_started.notify_one();
                Ok(ToolOutput::success(format!("Saving file as {}", target.display())))
            }
            CaptureScript::WriteImageAfter(delay, bytes) => {
                self.capture_started.notify_one();
                tokio::time::sleep(delay).await;
                write(bytes).await?;
                Ok(ToolOutput::success(format!("Saving file as {}", target.display())))
            }
            CaptureScript::ReportSuccessWithoutFile => {
                self.capture_started.notify_one();
                Ok(ToolOutput::success("New file is in location /capt0000.jpg on the camera"))
            }
            CaptureScript::WriteEmptyFile => {
                write(Vec::new()).await?;
                self.capture_started.notify_one();
                Ok(ToolOutput::success(format!("Saving file as {}", target.display())))
            }
            CaptureScript::ExitWith { code, stderr } => {
                self.capture_started.notify_one();
                Ok(ToolOutput::failure(code, stderr))
            }
            CaptureScript::HangAfterPartialWrite(bytes) => {
                write(bytes).await?;
                self.capture_started.notify_one();
                std::future::pending().await
            }
            CaptureScript::Fail(err) => Err(err),
        }
    }
}

/// Keeps the in-flight counter accurate even when the capture future is
/// dropped mid-way.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GuestDriver for MockGuest {
    async fn list_cameras(&self, privileged: bool) -> Result<Vec<GuestCamera>, DriverError> {
        let op = if privileged {
            GuestOp::ListPrivileged
        } else {
            GuestOp::ListUnprivileged
        };
        self.record(op)?;

        let (script, cameras, denied) = {
            let mut inner = self.lock();
            let script = if privileged {
                inner.privileged_lists.pop_front()
            } else {
                inner.unprivileged_lists.pop_front()
            };
            (script, inner.cameras.clone(), !privileged && inner.deny_unprivileged)
        };

        match script {
            Some(ListScript::Cameras(cameras)) => Ok(cameras),
            Some(ListScript::Fail(err)) => Err(err),
            Some(ListScript::Hang) => std::future::pending().await,
            None if denied => Err(DriverError::PermissionDenied(
                "Could not claim the USB device".into(),
            )),
            None => Ok(cameras),
        }
    }

    async fn capture(&self, target: &Path, _port: Option<String>) -> Result<ToolOutput, DriverError> {
        self.record(GuestOp::Capture)?;
        let script = {
            let mut inner = self.lock();
            let next = inner.captures.pop_front();
            next.unwrap_or_else(|| inner.default_capture.clone())
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.run_capture(target, script).await
    }

    async fn terminate_capture(&self) -> Result<(), DriverError> {
        self.record(GuestOp::Terminate)
    }

    async fn repair_access(&self) -> Result<(), DriverError> {
        self.record(GuestOp::RepairAccess)?;
        let mut inner = self.lock();
        if inner.repair_grants_access {
            inner.deny_unprivileged = false;
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), DriverError> {
        self.record(GuestOp::Restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tethercam_mock_guest_{}_{name}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_default_capture_writes_image() {
        // Arrange
        let guest = MockGuest::new();
        let path = temp_file("a.jpg");

        // Act
        let out = guest.capture(&path, None).await.expect("capture");

        // Assert
        assert!(out.is_success());
        assert_eq!(std::fs::read(&path).expect("read"), FAKE_JPEG);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_deny_unprivileged_only_affects_unprivileged_listing() {
        let guest = MockGuest::new();
        guest.deny_unprivileged(true);

        assert!(matches!(
            guest.list_cameras(false).await,
            Err(DriverError::PermissionDenied(_))
        ));
        assert_eq!(guest.list_cameras(true).await.expect("privileged").len(), 1);
    }

    #[tokio::test]
    async fn test_repair_can_grant_access() {
        let guest = MockGuest::new();
        guest.deny_unprivileged(true);
        guest.repair_grants_access(true);

        guest.repair_access().await.expect("repair");

        assert!(guest.list_cameras(false).await.is_ok());
        assert_eq!(guest.count(GuestOp::RepairAccess), 1);
    }

    #[tokio::test]
    async fn test_in_flight_counter_resets_after_drop() {
        let guest = MockGuest::new();
        let path = temp_file("hang.jpg");
        guest.script_capture(CaptureScript::HangAfterPartialWrite(vec![1, 2, 3]));

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), guest.capture(&path, None)).await;

        assert!(result.is_err());
        assert_eq!(guest.max_concurrent_captures(), 1);
        assert_eq!(guest.in_flight.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_file(&path);
    }
}
