//! Task definitions and the YAML task-document loader

pub mod loader;
pub mod types;


pub use loader::TaskLoader;
pub use types::*;
