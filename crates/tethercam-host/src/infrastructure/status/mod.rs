//! Status query interface: JSON view of the capture pipeline.
//!
//! `tethercam status` and any external dashboard read the pipeline through
//! here.  Two sources are supported:
//!
//! - a live [`RecoveryCoordinator`] in this process ([`query_status`]), and
//! - the state file written by another process ([`query_persisted_status`]).
//!
//! # Data Transfer Objects (for beginners)
//!
//! The domain types (`SessionState`, `CaptureAttempt`, ...) carry
//! `SystemTime`, `Duration`, and `Uuid` values whose serde encoding is awkward
//! for scripts.  The DTOs here flatten those into plain strings and
//! Unix-millisecond integers, so a shell one-liner like
//! `tethercam status | jq .data.active.stage` just works.
//!
//! Every query returns `CommandResult<T>`, which always has the shape
//! `{ success: bool, data: T | null, error: string | null }`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tethercam_core::{
    ActiveSession, CaptureAttempt, DeviceSnapshot, HealthReport, SessionState, SessionSummary,
};

use crate::application::recover::RecoveryCoordinator;
use crate::application::session_store::read_state_file;

// ── Data Transfer Objects ─────────────────────────────────────────────────────

/// Whole-pipeline status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDto {
    pub device: Option<DeviceDto>,
    pub active: Option<ActiveDto>,
    pub last_session: Option<SessionDto>,
    pub last_health: Option<HealthDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDto {
    /// `vvvv:pppp`
    pub id: String,
    pub bus_address: String,
    pub state: String,
    pub observed_at_ms: u64,
}

/// The session currently holding the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveDto {
    pub session_id: String,
    pub attempt: u32,
    /// `null` while backing off between attempts.
    pub stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDto {
    pub session_id: String,
    pub created_at_ms: u64,
    pub output_path: String,
    pub status: String,
    pub terminal_error: Option<String>,
    pub artifact_bytes: Option<u64>,
    pub attempts: Vec<AttemptDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptDto {
    pub sequence: u32,
    pub stage: String,
    pub escalation: String,
    /// `null` for a successful attempt.
    pub failure: Option<String>,
    pub detail: Option<String>,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDto {
    pub checked_at_ms: u64,
    pub healthy: bool,
    pub failure: Option<String>,
    pub detail: String,
    pub repaired: bool,
}

/// Unified response wrapper for status queries.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl From<&SessionState> for StatusDto {
    fn from(state: &SessionState) -> Self {
        Self {
            device: state.device.as_ref().map(DeviceDto::from),
            active: state.active.as_ref().map(ActiveDto::from),
            last_session: state.last_session.as_ref().map(SessionDto::from),
            last_health: state.last_health.as_ref().map(HealthDto::from),
        }
    }
}

impl From<&DeviceSnapshot> for DeviceDto {
    fn from(d: &DeviceSnapshot) -> Self {
        Self {
            id: d.id.to_string(),
            bus_address: d.bus_address.to_string(),
            state: d.state.to_string(),
            observed_at_ms: unix_ms(d.observed_at),
        }
    }
}

impl From<&ActiveSession> for ActiveDto {
    fn from(a: &ActiveSession) -> Self {
        Self {
            session_id: a.id.to_string(),
            attempt: a.attempt,
            stage: a.stage.map(|s| s.to_string()),
        }
    }
}

impl From<&SessionSummary> for SessionDto {
    fn from(s: &SessionSummary) -> Self {
        Self {
            session_id: s.id.to_string(),
            created_at_ms: unix_ms(s.created_at),
            output_path: s.output_path.display().to_string(),
            status: s.status.to_string(),
            terminal_error: s.terminal_error.map(|k| k.to_string()),
            artifact_bytes: s.artifact.as_ref().map(|a| a.size_bytes),
            attempts: s.attempts.iter().map(AttemptDto::from).collect(),
        }
    }
}

impl From<&CaptureAttempt> for AttemptDto {
    fn from(a: &CaptureAttempt) -> Self {
        let detail = match &a.outcome {
            tethercam_core::AttemptOutcome::Success => None,
            tethercam_core::AttemptOutcome::Failure(f) => Some(f.detail.clone()),
        };
        Self {
            sequence: a.sequence,
            stage: a.stage.to_string(),
            escalation: a.escalation.to_string(),
            failure: a.failure_kind().map(|k| k.to_string()),
            detail,
            started_at_ms: unix_ms(a.started_at),
            duration_ms: a.duration.as_millis() as u64,
        }
    }
}

impl From<&HealthReport> for HealthDto {
    fn from(h: &HealthReport) -> Self {
        Self {
            checked_at_ms: unix_ms(h.checked_at),
            healthy: h.healthy,
            failure: h.failure.map(|k| k.to_string()),
            detail: h.detail.clone(),
            repaired: h.repaired,
        }
    }
}

// ── Queries ───────────────────────────────────────────────────────────────────

/// Status of the pipeline owned by `coordinator`.
pub fn query_status(coordinator: &RecoveryCoordinator) -> CommandResult<StatusDto> {
    CommandResult::ok(StatusDto::from(&coordinator.status()))
}

/// Status as last written to the state file at `path`.
///
/// A missing file means nothing has run yet and yields an empty status.
pub fn query_persisted_status(path: &Path) -> CommandResult<StatusDto> {
    if !path.exists() {
        return CommandResult::ok(StatusDto::from(&SessionState::default()));
    }
    match read_state_file(path) {
        Ok(state) => CommandResult::ok(StatusDto::from(&state)),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
