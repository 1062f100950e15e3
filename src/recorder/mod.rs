//! Capture session module
//!
//! - CaptureSession owns the ring buffer and both producer threads
//! - State, session bookkeeping and broadcast events live in `state`

pub mod session;
pub mod state;

pub use session::CaptureSession;
pub use state::{ReplayEvent, RestartReason, SessionInfo, SessionState};
