//! # tethercam-core
//!
//! Shared domain library for TetherCam: the entities and rules behind
//! capturing a photo from a USB camera that is plugged into a host machine but
//! used from inside an isolated guest (for example a WSL distro).
//!
//! This crate has zero dependencies on OS APIs, subprocesses, or async
//! runtimes.  Everything here can be unit-tested without a camera.
//!
//! # Architecture overview (for beginners)
//!
//! Getting a tethered camera to take a picture from inside a guest is a
//! multi-step dance: find the device on the host, share it with the
//! redirection facility ("bind"), hand it to the guest ("attach"), check the
//! guest can actually see it, then run the capture tool.  Any step can fail,
//! and the right reaction depends on *which* step failed and *how*.
//!
//! - **`domain::device`** – USB identity, bus address, and the redirection
//!   state machine (`Unbound → Bound → Attached → Detached`).
//! - **`domain::failure`** – The typed failure taxonomy every pipeline stage
//!   reports into.
//! - **`domain::session`** – A capture session and its ordered, immutable
//!   attempt history.
//! - **`domain::policy`** – The recovery policy: attempt budget, per-stage
//!   timeouts, escalation ladder, and backoff schedule, plus the pure
//!   retry/escalation decision.
//! - **`domain::state`** – The read-only status view published for
//!   observability.

pub mod domain;

pub use domain::device::{
    BusAddress, Device, DeviceParseError, InvalidTransition, RedirectionState, Transition, UsbId,
};
pub use domain::failure::{FailureKind, StageFailure};
pub use domain::policy::{
    BackoffSchedule, EscalationStep, PolicyError, RecoveryPolicy, RetryDecision, StageTimeouts,
};
pub use domain::session::{
    Artifact, AttemptOutcome, CaptureAttempt, CaptureSession, SessionId, SessionStatus,
    SessionTransitionError, Stage,
};
pub use domain::state::{ActiveSession, DeviceSnapshot, HealthReport, SessionState, SessionSummary};
