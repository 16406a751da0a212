//! Infrastructure layer for the capture orchestrator.
//!
//! Contains OS-facing adapters: the subprocess runner, the host redirection
//! driver (`usbipd`), the guest driver (`wsl` + `gphoto2`), configuration
//! file storage, and the status query DTOs.

pub mod guest;
pub mod process;
pub mod redirection;
pub mod status;
pub mod storage;
