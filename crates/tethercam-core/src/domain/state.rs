//! Read-only status view of the capture pipeline.
//!
//! [`SessionState`] is what external tooling sees when it asks "what is the
//! camera doing?".  It is written only by the recovery coordinator and
//! handed out to everyone else as a cloned snapshot.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::device::{BusAddress, Device, RedirectionState, UsbId};
use super::failure::FailureKind;
use super::session::{Artifact, CaptureAttempt, CaptureSession, SessionId, SessionStatus, Stage};

/// Last observed redirection state of the target device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: UsbId,
    pub bus_address: BusAddress,
    pub state: RedirectionState,
    pub observed_at: SystemTime,
}

impl DeviceSnapshot {
    pub fn of(device: &Device) -> Self {
        Self {
            id: device.id,
            bus_address: device.bus_address.clone(),
            state: device.state,
            observed_at: SystemTime::now(),
        }
    }
}

/// Progress of the session currently holding the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: SessionId,
    pub attempt: u32,
    /// `None` between attempts (e.g. while backing off).
    pub stage: Option<Stage>,
}

/// Summary of the most recently finished (or running) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: SystemTime,
    pub output_path: PathBuf,
    pub status: SessionStatus,
    pub terminal_error: Option<FailureKind>,
    pub artifact: Option<Artifact>,
    pub attempts: Vec<CaptureAttempt>,
}

impl From<&CaptureSession> for SessionSummary {
    fn from(session: &CaptureSession) -> Self {
        Self {
            id: session.id(),
            created_at: session.created_at(),
            output_path: session.output_path().to_path_buf(),
            status: session.status(),
            terminal_error: session.terminal_error(),
            artifact: session.artifact().cloned(),
            attempts: session.attempts().to_vec(),
        }
    }
}

/// Outcome of the most recent supervisory health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: SystemTime,
    pub healthy: bool,
    pub failure: Option<FailureKind>,
    pub detail: String,
    /// `true` when the check re-established the passthrough link.
    pub repaired: bool,
}

/// Everything the status query interface exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub device: Option<DeviceSnapshot>,
    pub active: Option<ActiveSession>,
    pub last_session: Option<SessionSummary>,
    pub last_health: Option<HealthReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::CaptureSession;

    #[test]
    fn test_default_state_is_empty() {
        let state = SessionState::default();
        assert!(state.device.is_none());
        assert!(state.active.is_none());
        assert!(state.last_session.is_none());
    }

    #[test]
    fn test_summary_copies_session_fields() {
        let session = CaptureSession::new("/photos/a.jpg");
        let summary = SessionSummary::from(&session);
        assert_eq!(summary.id, session.id());
        assert_eq!(summary.status, SessionStatus::Pending);
        assert_eq!(summary.output_path, PathBuf::from("/photos/a.jpg"));
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let device = Device::new(UsbId::new(0x04b0, 0x0454), "1-4".parse().unwrap(), RedirectionState::Attached);
        let state = SessionState {
            device: Some(DeviceSnapshot::of(&device)),
            ..SessionState::default()
        };
        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("\"04b0:0454\""));
        let restored: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
