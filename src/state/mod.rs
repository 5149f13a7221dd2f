//! Process-scoped state
//!
//! The owning process keeps exactly one [`SessionManager`]; it holds the
//! single optional peer session and replaces it on reconnect.

mod session_manager;

pub use session_manager::{ManagerDeps, SessionManager};
