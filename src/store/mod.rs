//! Persistence layer: JSON-file session memory.

pub mod session;
pub mod sessions;

pub use session::{Role, Session, SessionState, Turn, facts};
pub use sessions::{CommitStatus, SessionStore, SessionStoreOptions};
