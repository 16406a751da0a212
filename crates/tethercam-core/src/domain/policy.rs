//! Recovery policy: attempt budget, per-stage timeouts, escalation ladder, and
//! backoff schedule.
//!
//! The policy is a configuration object.  It is validated once when it is
//! built and never mutated afterwards; the coordinator only asks it
//! questions ("how long may this stage take?", "what do I do after this
//! failure?").
//!
//! # Escalation ladder (for beginners)
//!
//! When an attempt fails, simply trying the same thing again rarely helps:
//! a wedged USB/IP link stays wedged.  The ladder lists recovery actions from
//! least to most invasive.  Each failure moves the session up (never down)
//! the ladder, so the next attempt starts with a stronger remedy:
//!
//! ```text
//! initial → soft_reattach → forced_rebind → elevated_privilege → guest_reset
//! ```
//!
//! Permission problems are handled specially: they jump straight to the
//! first elevated rung, and if an elevated attempt still hits a permission
//! error the session gives up, since that points at configuration rather than
//! flakiness.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::failure::FailureKind;
use super::session::Stage;

/// Recovery action applied at the start of an attempt, ordered by
/// invasiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStep {
    /// No recovery action.
    Initial,
    /// Detach the device, then bind/attach as usual.
    SoftReattach,
    /// Detach, force the device to be re-shared, then attach.
    ForcedRebind,
    /// After attaching, run the privileged guest-side access repair.
    ElevatedPrivilege,
    /// Detach, restart the guest, then attach and repair access.
    GuestReset,
}

impl EscalationStep {
    /// `true` for steps that run the privileged access repair.
    pub fn is_elevated(self) -> bool {
        self >= Self::ElevatedPrivilege
    }

    /// `true` for steps that pull the device back from the guest first.
    pub fn detaches_first(self) -> bool {
        matches!(self, Self::SoftReattach | Self::ForcedRebind | Self::GuestReset)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::SoftReattach => "soft_reattach",
            Self::ForcedRebind => "forced_rebind",
            Self::ElevatedPrivilege => "elevated_privilege",
            Self::GuestReset => "guest_reset",
        }
    }
}

impl fmt::Display for EscalationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on how long each pipeline stage may take per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub locate: Duration,
    /// Applies to each individual bind/attach/detach call.
    pub passthrough: Duration,
    pub probe: Duration,
    pub capture: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Locate => self.locate,
            Stage::Passthrough => self.passthrough,
            Stage::Probe => self.probe,
            Stage::Capture => self.capture,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            locate: Duration::from_secs(8),
            passthrough: Duration::from_secs(30),
            probe: Duration::from_secs(12),
            capture: Duration::from_secs(45),
        }
    }
}

/// Exponential backoff between attempts, capped at `max`.
///
/// With `multiplier >= 1` and `max >= initial` the produced delays never
/// decrease from one retry to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffSchedule {
    /// A schedule that never waits.
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1 = the wait after the first failed
    /// attempt).  `retry == 0` yields no delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(8),
        }
    }
}

/// Reasons a policy fails validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("escalation ladder must not be empty")]
    EmptyLadder,
    #[error("escalation ladder must be strictly increasing: {0} does not follow {1}")]
    LadderNotIncreasing(EscalationStep, EscalationStep),
    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(Stage),
    #[error("invalid backoff schedule: {0}")]
    InvalidBackoff(String),
}

/// What the coordinator should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Run another attempt at ladder index `rung` after waiting `delay`.
    Retry { rung: usize, delay: Duration },
    /// Stop; the last failure becomes the session's terminal error.
    GiveUp,
}

/// Validated, immutable recovery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    max_attempts: u32,
    timeouts: StageTimeouts,
    ladder: Vec<EscalationStep>,
    backoff: BackoffSchedule,
}

impl RecoveryPolicy {
    /// Builds a policy after validating every field.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when the attempt budget is zero, the ladder is
    /// empty or not strictly increasing, a stage timeout is zero, or the
    /// backoff schedule could produce decreasing delays.
    pub fn new(
        max_attempts: u32,
        timeouts: StageTimeouts,
        ladder: Vec<EscalationStep>,
        backoff: BackoffSchedule,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if ladder.is_empty() {
            return Err(PolicyError::EmptyLadder);
        }
        for pair in ladder.windows(2) {
            if pair[1] <= pair[0] {
                return Err(PolicyError::LadderNotIncreasing(pair[1], pair[0]));
            }
        }
        for stage in Stage::ALL {
            if timeouts.for_stage(stage).is_zero() {
                return Err(PolicyError::ZeroTimeout(stage));
            }
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(PolicyError::InvalidBackoff(format!(
                "multiplier {} must be a finite number >= 1",
                backoff.multiplier
            )));
        }
        if backoff.max < backoff.initial {
            return Err(PolicyError::InvalidBackoff(format!(
                "max {:?} is shorter than initial {:?}",
                backoff.max, backoff.initial
            )));
        }

        Ok(Self {
            max_attempts,
            timeouts,
            ladder,
            backoff,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }

    pub fn ladder(&self) -> &[EscalationStep] {
        &self.ladder
    }

    pub fn backoff(&self) -> &BackoffSchedule {
        &self.backoff
    }

    /// Escalation step at ladder index `rung` (clamped to the top rung).
    pub fn step(&self, rung: usize) -> EscalationStep {
        self.ladder[rung.min(self.ladder.len() - 1)]
    }

    /// Decides what follows a failed attempt.
    ///
    /// `attempts_made` counts every attempt recorded so far (including the
    /// one that just failed); `rung` is the ladder index that attempt ran at.
    /// The returned rung is never lower than `rung`.
    pub fn decide(&self, attempts_made: u32, rung: usize, failure: FailureKind) -> RetryDecision {
        if failure.is_fatal() || attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let top = self.ladder.len() - 1;
        let rung = rung.min(top);
        let next = if failure == FailureKind::PermissionDenied {
            if self.ladder[rung].is_elevated() {
                return RetryDecision::GiveUp;
            }
            match (rung + 1..=top).find(|&i| self.ladder[i].is_elevated()) {
                Some(i) => i,
                None => return RetryDecision::GiveUp,
            }
        } else {
            (rung + 1).min(top)
        };

        RetryDecision::Retry {
            rung: next,
            delay: self.backoff.delay_for(attempts_made),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeouts: StageTimeouts::default(),
            ladder: vec![
                EscalationStep::Initial,
                EscalationStep::SoftReattach,
                EscalationStep::ForcedRebind,
                EscalationStep::ElevatedPrivilege,
                EscalationStep::GuestReset,
            ],
            backoff: BackoffSchedule::default(),
        }
    }
}
