//! Infrastructure layer: key-value backends, snapshot persistence and
//! configuration loading.

pub mod config;
pub mod flusher;
pub mod persistence;

pub use config::*;
pub use flusher::*;
pub use persistence::*;
