//! Domain entities for TetherCam.
//!
//! Pure business rules with no infrastructure dependencies.  Outer layers
//! (the application use cases and the subprocess-backed drivers) depend on
//! these types; nothing in here depends on them.

pub mod device;
pub mod failure;
pub mod policy;
pub mod session;
pub mod state;
