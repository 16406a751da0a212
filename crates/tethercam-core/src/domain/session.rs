//! Capture sessions and their attempt history.
//!
//! A [`CaptureSession`] is one end-to-end request to produce a single image.
//! It owns an ordered list of [`CaptureAttempt`]s, one per full pipeline run.
//! Attempts are append-only: once recorded they are only reachable through
//! shared references, so nothing can rewrite history.
//!
//! # Session lifecycle
//!
//! ```text
//!            ┌──► Succeeded
//! Pending ───┼──► Failed      (terminal; no further mutation)
//!            └──► Aborted
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::failure::{FailureKind, StageFailure};
use super::policy::EscalationStep;

/// Unique identifier for a capture session.
pub type SessionId = Uuid;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locate,
    Passthrough,
    Probe,
    Capture,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Locate, Stage::Passthrough, Stage::Probe, Stage::Capture];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locate => "locate",
            Self::Passthrough => "passthrough",
            Self::Probe => "probe",
            Self::Capture => "capture",
        };
        f.write_str(s)
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure(StageFailure),
}

/// One full pipeline run within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureAttempt {
    /// 1-based position within the session.
    pub sequence: u32,
    /// Furthest stage the attempt reached.
    pub stage: Stage,
    /// Escalation step the attempt ran at.
    pub escalation: EscalationStep,
    pub outcome: AttemptOutcome,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl CaptureAttempt {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::Failure(failure) => Some(failure.kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success)
    }
}

/// The image produced by a successful capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Session status.  Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Illegal mutation of a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionTransitionError {
    #[error("session {id} is already {status}")]
    AlreadyTerminal { id: SessionId, status: SessionStatus },
    #[error("attempt {got} recorded out of order; expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
}

/// One end-to-end capture request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    id: SessionId,
    created_at: SystemTime,
    output_path: PathBuf,
    attempts: Vec<CaptureAttempt>,
    status: SessionStatus,
    terminal_error: Option<FailureKind>,
    artifact: Option<Artifact>,
}

impl CaptureSession {
    /// Creates a pending session targeting `output_path`.
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: SystemTime::now(),
            output_path: output_path.into(),
            attempts: Vec::new(),
            status: SessionStatus::Pending,
            terminal_error: None,
            artifact: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn attempts(&self) -> &[CaptureAttempt] {
        &self.attempts
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Failure kind surfaced for a `Failed` session.
    pub fn terminal_error(&self) -> Option<FailureKind> {
        self.terminal_error
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sequence number the next recorded attempt must carry.
    pub fn next_sequence(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn last_attempt(&self) -> Option<&CaptureAttempt> {
        self.attempts.last()
    }

    /// Appends a finished attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SessionTransitionError::AlreadyTerminal`] once the session has
    /// ended, and [`SessionTransitionError::OutOfOrder`] when the attempt's
    /// sequence number is not [`next_sequence`](Self::next_sequence).
    pub fn record_attempt(&mut self, attempt: CaptureAttempt) -> Result<(), SessionTransitionError> {
        self.ensure_pending()?;
        let expected = self.next_sequence();
        if attempt.sequence != expected {
            return Err(SessionTransitionError::OutOfOrder {
                expected,
                got: attempt.sequence,
            });
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Marks the session `Succeeded` with the validated artifact.
    pub fn succeed(&mut self, artifact: Artifact) -> Result<(), SessionTransitionError> {
        self.ensure_pending()?;
        self.status = SessionStatus::Succeeded;
        self.artifact = Some(artifact);
        Ok(())
    }

    /// Marks the session `Failed`, surfacing `kind` as its terminal error.
    pub fn fail(&mut self, kind: FailureKind) -> Result<(), SessionTransitionError> {
        self.ensure_pending()?;
        self.status = SessionStatus::Failed;
        self.terminal_error = Some(kind);
        Ok(())
    }

    /// Marks the session `Aborted` at the caller's request.
    pub fn abort(&mut self) -> Result<(), SessionTransitionError> {
        self.ensure_pending()?;
        self.status = SessionStatus::Aborted;
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), SessionTransitionError> {
        if self.status.is_terminal() {
            return Err(SessionTransitionError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}
