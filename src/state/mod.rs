//! Line script and session persistence

mod script;
mod session;

pub use script::LineScript;
pub use session::{Session, SessionStore};
