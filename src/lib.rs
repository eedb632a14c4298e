pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod notify;
pub mod orchestration;
pub mod session;
pub mod util;

pub use error::{Error, Result};
pub use session::{Session, SessionId, SessionStatus, SessionStore};
