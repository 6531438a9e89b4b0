//! Application layer: the state store every builder command goes through and
//! the per-session context it operates on.

pub mod session;
pub mod state;

pub use session::*;
pub use state::*;
