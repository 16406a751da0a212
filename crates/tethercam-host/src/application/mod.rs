//! Application layer use cases for the capture orchestrator.
//!
//! Use cases here orchestrate domain objects from `tethercam_core` and talk
//! to the outside world only through the driver traits defined in
//! `infrastructure::redirection` and `infrastructure::guest`, so every one of
//! them can be exercised against the mock drivers.
//!
//! # Sub-modules
//!
//! - **`locate_device`**  – Device Registry: resolves the camera's current bus
//!   address from the host listing.
//! - **`passthrough`**    – Passthrough Controller: idempotent bind / attach /
//!   detach with per-transition timeouts.
//! - **`probe_guest`**    – Guest Health Prober: can the guest see and open
//!   the camera?
//! - **`capture_image`**  – Capture Executor: one shot, timeout-enforced,
//!   artifact-validated.
//! - **`recover`**        – Recovery Coordinator: the session state machine
//!   with escalation, backoff, admission, and abort.
//! - **`session_store`**  – Session State Store: the published status view.
//! - **`health_monitor`** – Supervisory loop that probes the camera while no
//!   session is running.

pub mod capture_image;
pub mod health_monitor;
pub mod locate_device;
pub mod passthrough;
pub mod probe_guest;
pub mod recover;
pub mod session_store;
