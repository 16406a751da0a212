//! Storage infrastructure: configuration file persistence and the
//! cross-process session lock.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file from the platform config directory
//!   or an explicit path.
//! - Providing the stock deployment defaults (Nikon Z6_3, Ubuntu distro) when the file does not
//!   exist yet, so a bare `tethercam capture` works out of the box.
//! - Turning the raw file values into validated domain objects
//!   ([`tethercam_core::UsbId`], [`tethercam_core::RecoveryPolicy`]).
//!
//! The `session_lock` sub-module keeps two `tethercam` processes from
//! driving the camera at the same time.

pub mod config;
pub mod session_lock;
