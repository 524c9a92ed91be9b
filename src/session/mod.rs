//! Session management module

pub mod manager;
pub mod state;

pub use manager::{ReaperHandle, SessionManager};
pub use state::{Session, SessionId, SessionStatus};
