//! Failure taxonomy shared by every pipeline stage.
//!
//! Each stage (locate, passthrough, probe, capture) reports either success or
//! a [`StageFailure`]: a typed [`FailureKind`] plus opaque diagnostic text
//! captured from the underlying tool.  The recovery policy only ever looks at
//! the kind; the detail exists for humans reading logs and status output.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified reason a pipeline stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No host device matches the configured vendor/product identity.
    DeviceNotFound,
    /// A redirection transition was attempted out of order.
    InvalidState,
    /// A bind/attach/detach (or the host listing) exceeded its timeout.
    PassthroughTimeout,
    /// The host redirection tool refused a transition.
    PassthroughRejected,
    /// The guest cannot see the device.
    Unreachable,
    /// The guest sees the device but the capture user may not open it.
    PermissionDenied,
    /// The capture tool exceeded its timeout and was terminated.
    CaptureTimeout,
    /// The capture tool exited unsuccessfully for an unrecognised reason.
    CaptureFailed,
    /// The target output path already exists.
    OutputCollision,
    /// The capture tool reported success but left no usable file.
    ArtifactMissing,
    /// The host redirection facility itself is down.  Never retried.
    RedirectionMechanismUnreachable,
}

impl FailureKind {
    /// `true` for failures that end the session immediately.
    pub fn is_fatal(self) -> bool {
        self == Self::RedirectionMechanismUnreachable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceNotFound => "device_not_found",
            Self::InvalidState => "invalid_state",
            Self::PassthroughTimeout => "passthrough_timeout",
            Self::PassthroughRejected => "passthrough_rejected",
            Self::Unreachable => "unreachable",
            Self::PermissionDenied => "permission_denied",
            Self::CaptureTimeout => "capture_timeout",
            Self::CaptureFailed => "capture_failed",
            Self::OutputCollision => "output_collision",
            Self::ArtifactMissing => "artifact_missing",
            Self::RedirectionMechanismUnreachable => "redirection_mechanism_unreachable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed stage failure with free-form diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}
