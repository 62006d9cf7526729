//! Per-connection sessions and the registry that connects them.

pub mod connection;
pub mod registry;

pub use connection::{Session, SessionContext, SessionState};
pub use registry::{SessionHandle, SessionInfo, SessionRegistry};
