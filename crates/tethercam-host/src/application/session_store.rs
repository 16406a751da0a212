//! Session State Store: the published view of device and session state.
//!
//! Only the recovery coordinator writes to the store (the mutators are
//! `pub(crate)`); everyone else reads cloned [`SessionState`] snapshots.
//! When a state file is configured every update is also written to disk as
//! pretty-printed JSON, so `tethercam status` can report on a session run
//! by another process.
//!
//! A persistent store also owns the [`SessionLock`] beside its file.  Only the
//! process holding that lock may write the file, and it re-reads the file
//! after taking the lock so it never overwrites newer state with its own
//! stale copy.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tethercam_core::{ActiveSession, CaptureSession, Device, DeviceSnapshot, HealthReport, SessionState, SessionSummary};
use thiserror::Error;
use tracing::{debug, warn};

use crate::infrastructure::storage::session_lock::SessionLock;

/// Errors reading or writing the state file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// In-memory state with optional JSON persistence.
#[derive(Debug, Default)]
pub struct SessionStateStore {
    state: RwLock<SessionState>,
    persist_path: Option<PathBuf>,
    lock: Option<SessionLock>,
}

impl SessionStateStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A store backed by `path`, seeded from it when it exists.
    ///
    /// An `active` session found in the file is only stale when no other
    /// process holds the session lock; then it is cleared and logged.  A
    /// session that is still running elsewhere is left as recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when an existing file cannot be read or parsed.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = SessionLock::beside(&path);
        let mut state = if path.exists() {
            read_state_file(&path)?
        } else {
            SessionState::default()
        };
        if let Some(active) = &state.active {
            match lock.try_acquire() {
                Ok(Some(_held)) => {
                    warn!("session {} did not finish in a previous run", active.id);
                    state.active = None;
                }
                Ok(None) => debug!("session {} is running in another process", active.id),
                Err(e) => warn!("cannot check whether session {} is still running: {e}", active.id),
            }
        }
        Ok(Self {
            state: RwLock::new(state),
            persist_path: Some(path),
            lock: Some(lock),
        })
    }

    /// The lock guarding the state file, if the store is persistent.
    pub fn session_lock(&self) -> Option<&SessionLock> {
        self.lock.as_ref()
    }

    /// Reloads the state file after the caller has taken the session lock.
    ///
    /// Another process may have written the file since this store last did.
    /// Any `active` entry in it is stale because the lock holder is us.
    pub(crate) fn resync(&self) {
        let Some(path) = self.persist_path.as_ref().filter(|p| p.exists()) else {
            return;
        };
        match read_state_file(path) {
            Ok(mut state) => {
                if let Some(stale) = state.active.take() {
                    warn!("session {} did not finish in a previous run", stale.id);
                }
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
            }
            Err(e) => warn!("keeping in-memory session state: {e}"),
        }
    }

    /// Cloned copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    pub(crate) fn update_device(&self, device: &Device) {
        self.mutate(|state| state.device = Some(DeviceSnapshot::of(device)));
    }

    pub(crate) fn begin_session(&self, session: &CaptureSession) {
        self.mutate(|state| {
            state.active = Some(ActiveSession {
                id: session.id(),
                attempt: session.next_sequence(),
                stage: None,
            });
            state.last_session = Some(SessionSummary::from(session));
        });
    }

    pub(crate) fn set_active(&self, active: ActiveSession) {
        self.mutate(|state| state.active = Some(active));
    }

    /// Publishes the session's latest attempt history without ending it.
    pub(crate) fn update_session(&self, session: &CaptureSession) {
        self.mutate(|state| state.last_session = Some(SessionSummary::from(session)));
    }

    pub(crate) fn finish_session(&self, session: &CaptureSession) {
        self.mutate(|state| {
            state.active = None;
            state.last_session = Some(SessionSummary::from(session));
        });
    }

    pub(crate) fn record_health(&self, report: HealthReport) {
        self.mutate(|state| state.last_health = Some(report));
    }

    fn mutate(&self, f: impl FnOnce(&mut SessionState)) {
        let snapshot = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
            self.persist_path.as_ref().map(|_| guard.clone())
        };
        if let (Some(path), Some(state)) = (&self.persist_path, snapshot) {
            if let Err(e) = write_state_file(path, &state) {
                warn!("failed to persist session state: {e}");
            }
        }
    }
}

/// Reads a state file written by [`SessionStateStore`].
///
/// # Errors
///
/// Returns [`StoreError`] when the file cannot be read or parsed.
pub fn read_state_file(path: &Path) -> Result<SessionState, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `state` to a sibling temp file, then renames it over `path`.
fn write_state_file(path: &Path, state: &SessionState) -> Result<(), StoreError> {
    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(state).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}
