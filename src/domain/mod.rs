//! Domain layer: workspace entities, bindings and the error taxonomy.

pub mod errors;
pub mod models;
pub mod parser;
pub mod services;
pub mod workspace;

pub use errors::*;
pub use models::*;
pub use parser::Binding;
pub use services::*;
pub use workspace::*;
