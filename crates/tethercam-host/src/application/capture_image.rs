//! Capture Executor: one image, one output path, bounded time.
//!
//! # Guarantees (for beginners)
//!
//! - An existing file at the output path is never overwritten or deleted.
//! - When the capture times out or is aborted, the running tool is killed
//!   (dropping the driver future kills the child process; an explicit
//!   guest-side kill covers the process inside the guest) and whatever it
//!   managed to write is removed.
//! - A capture only counts as successful when the file exists and is not
//!   empty, whatever the tool's exit code claimed.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tethercam_core::{Artifact, FailureKind, StageFailure};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::infrastructure::guest::{GuestDriver, PERMISSION_MARKERS};
use crate::infrastructure::process::{DriverError, ToolOutput};

const UNREACHABLE_MARKERS: &[&str] = &[
    "no camera found",
    "could not detect any camera",
    "could not find the requested device",
    "no such device",
];

/// How long the guest-side kill of a stuck capture may take.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a capture did not produce an artifact.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Failed(#[from] StageFailure),
    #[error("capture aborted")]
    Aborted,
}

/// Runs the guest capture tool and validates what it produced.
pub struct CaptureExecutor {
    guest: Arc<dyn GuestDriver>,
}

impl CaptureExecutor {
    pub fn new(guest: Arc<dyn GuestDriver>) -> Self {
        Self { guest }
    }

    /// Captures one image into `output`.
    ///
    /// `port` selects the camera port reported by the probe.  `cancelled`
    /// resolves when the caller wants the capture abandoned.
    ///
    /// # Errors
    ///
    /// [`CaptureError::Aborted`] when `cancelled` resolved first, otherwise a
    /// [`StageFailure`] of kind `OutputCollision`, `CaptureTimeout`,
    /// `ArtifactMissing`, `PermissionDenied`, `Unreachable`, or `CaptureFailed`.
    pub async fn capture<C>(
        &self,
        output: &Path,
        timeout: Duration,
        port: Option<&str>,
        cancelled: C,
    ) -> Result<Artifact, CaptureError>
    where
        C: Future<Output = ()>,
    {
        if tokio::fs::try_exists(output).await.unwrap_or(true) {
            return Err(StageFailure::new(
                FailureKind::OutputCollision,
                format!("{} already exists", output.display()),
            )
            .into());
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StageFailure::new(
                    FailureKind::CaptureFailed,
                    format!("cannot create {}: {e}", parent.display()),
                )
            })?;
        }

        let run = time::timeout(timeout, self.guest.capture(output, port.map(str::to_owned)));
        let finished = tokio::select! {
            _ = cancelled => None,
            result = run => Some(result),
        };

        match finished {
            None => {
                info!("capture aborted; terminating tool");
                self.terminate().await;
                discard(output).await;
                Err(CaptureError::Aborted)
            }
            Some(Err(_elapsed)) => {
                warn!("capture exceeded {timeout:?}; terminating tool");
                self.terminate().await;
                discard(output).await;
                Err(StageFailure::new(
                    FailureKind::CaptureTimeout,
                    format!("capture did not finish within {timeout:?}"),
                )
                .into())
            }
            Some(Ok(Err(err))) => {
                discard(output).await;
                Err(driver_failure(err).into())
            }
            Some(Ok(Ok(out))) if !out.is_success() => {
                discard(output).await;
                Err(classify_tool_failure(&out).into())
            }
            Some(Ok(Ok(_))) => validate(output).await.map_err(CaptureError::from),
        }
    }

    async fn terminate(&self) {
        match time::timeout(TERMINATE_TIMEOUT, self.guest.terminate_capture()).await {
            Ok(Ok(())) => debug!("guest capture tool terminated"),
            Ok(Err(err)) => warn!("guest-side kill failed: {err}"),
            Err(_) => warn!("guest-side kill did not finish within {TERMINATE_TIMEOUT:?}"),
        }
    }
}

/// Checks that `output` exists and is non-empty.
async fn validate(output: &Path) -> Result<Artifact, StageFailure> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => {
            info!("captured {} ({} bytes)", output.display(), meta.len());
            Ok(Artifact {
                path: output.to_path_buf(),
                size_bytes: meta.len(),
            })
        }
        Ok(_) => {
            discard(output).await;
            Err(StageFailure::new(
                FailureKind::ArtifactMissing,
                format!("{} is empty", output.display()),
            ))
        }
        Err(e) => Err(StageFailure::new(
            FailureKind::ArtifactMissing,
            format!("tool reported success but {} is missing: {e}", output.display()),
        )),
    }
}

/// Removes partial output; a missing file is fine.
async fn discard(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!("removed partial output {}", output.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove partial output {}: {e}", output.display()),
    }
}

fn driver_failure(err: DriverError) -> StageFailure {
    match err {
        DriverError::Timeout(after) => StageFailure::new(
            FailureKind::CaptureTimeout,
            format!("capture tool timed out after {after:?}"),
        ),
        DriverError::PermissionDenied(detail) => {
            StageFailure::new(FailureKind::PermissionDenied, detail)
        }
        DriverError::Unavailable(detail) => StageFailure::new(FailureKind::Unreachable, detail),
        DriverError::Rejected(detail) => StageFailure::new(FailureKind::CaptureFailed, detail),
    }
}

/// Classifies a non-zero capture tool exit by its diagnostics.
pub fn classify_tool_failure(out: &ToolOutput) -> StageFailure {
    let detail = format!("exit code {:?}: {}", out.exit_code, out.diagnostics());
    let kind = if out.mentions_any(PERMISSION_MARKERS) {
        FailureKind::PermissionDenied
    } else if out.mentions_any(UNREACHABLE_MARKERS) {
        FailureKind::Unreachable
    } else {
        FailureKind::CaptureFailed
    };
    StageFailure::new(kind, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::guest::mock::{CaptureScript, GuestOp, MockGuest, FAKE_JPEG};
    use std::future::pending;
    use std::path::PathBuf;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn temp_output() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tethercam_capture_{}", uuid::Uuid::new_v4()))
            .join("shot.jpg")
    }

    fn executor() -> (Arc<MockGuest>, CaptureExecutor) {
        let guest = Arc::new(MockGuest::new());
        (guest.clone(), CaptureExecutor::new(guest))
    }

    fn kind(err: CaptureError) -> FailureKind {
        match err {
            CaptureError::Failed(f) => f.kind,
            CaptureError::Aborted => panic!("unexpected abort"),
        }
    }

    #[tokio::test]
    async fn test_capture_success_returns_artifact() {
        // Arrange
        let (_guest, exec) = executor();
        let output = temp_output();

        // Act
        let artifact = exec
            .capture(&output, TIMEOUT, Some("usb:001,004"), pending())
            .await
            .expect("captured");

        // Assert
        assert_eq!(artifact.path, output);
        assert_eq!(artifact.size_bytes, FAKE_JPEG.len() as u64);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_existing_file_is_collision_and_untouched() {
        // Arrange
        let (guest, exec) = executor();
        let output = temp_output();
        std::fs::create_dir_all(output.parent().expect("parent")).expect("mkdir");
        std::fs::write(&output, b"keep me").expect("seed");

        // Act
        let err = exec.capture(&output, TIMEOUT, None, pending()).await.unwrap_err();

        // Assert
        assert_eq!(kind(err), FailureKind::OutputCollision);
        assert_eq!(std::fs::read(&output).expect("read"), b"keep me");
        assert_eq!(guest.count(GuestOp::Capture), 0);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_success_without_file_is_artifact_missing() {
        let (guest, exec) = executor();
        guest.script_capture(CaptureScript::ReportSuccessWithoutFile);
        let output = temp_output();

        let err = exec.capture(&output, TIMEOUT, None, pending()).await.unwrap_err();

        assert_eq!(kind(err), FailureKind::ArtifactMissing);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_empty_file_is_artifact_missing_and_removed() {
        let (guest, exec) = executor();
        guest.script_capture(CaptureScript::WriteEmptyFile);
        let output = temp_output();

        let err = exec.capture(&output, TIMEOUT, None, pending()).await.unwrap_err();

        assert_eq!(kind(err), FailureKind::ArtifactMissing);
        assert!(!output.exists());
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_timeout_kills_tool_and_removes_partial_file() {
        // Arrange
        let (guest, exec) = executor();
        guest.script_capture(CaptureScript::HangAfterPartialWrite(vec![0xFF, 0xD8]));
        let output = temp_output();

        // Act
        let err = exec.capture(&output, TIMEOUT, None, pending()).await.unwrap_err();

        // Assert
        assert_eq!(kind(err), FailureKind::CaptureTimeout);
        assert!(!output.exists());
        assert_eq!(guest.count(GuestOp::Terminate), 1);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_abort_kills_tool_and_removes_partial_file() {
        // Arrange
        let (guest, exec) = executor();
        guest.script_capture(CaptureScript::HangAfterPartialWrite(vec![0xFF, 0xD8]));
        let output = temp_output();
        let started = guest.clone();

        // Act: cancel as soon as the partial file is on disk
        let cancelled = async move { started.capture_started().notified().await };
        let err = exec
            .capture(&output, Duration::from_secs(30), None, cancelled)
            .await
            .unwrap_err();

        // Assert
        assert!(matches!(err, CaptureError::Aborted));
        assert!(!output.exists());
        assert_eq!(guest.count(GuestOp::Terminate), 1);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[tokio::test]
    async fn test_capture_non_zero_exit_is_classified() {
        let (guest, exec) = executor();
        guest.script_capture(CaptureScript::ExitWith {
            code: 1,
            stderr: "*** Error: Could not claim the USB device ***".into(),
        });
        let output = temp_output();

        let err = exec.capture(&output, TIMEOUT, None, pending()).await.unwrap_err();

        assert_eq!(kind(err), FailureKind::PermissionDenied);
        let _ = std::fs::remove_dir_all(output.parent().expect("parent"));
    }

    #[test]
    fn test_classify_tool_failure_kinds() {
        let no_camera = ToolOutput::failure(1, "*** Error: No camera found. ***");
        assert_eq!(classify_tool_failure(&no_camera).kind, FailureKind::Unreachable);

        let other = ToolOutput::failure(1, "*** Error (-110: 'I/O in progress') ***");
        assert_eq!(classify_tool_failure(&other).kind, FailureKind::CaptureFailed);
    }
}
