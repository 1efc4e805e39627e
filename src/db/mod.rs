//! Database module for ponwatch.
//!
//! Provides the persistence traits the engine consumes and a SQLite store
//! implementing them.

mod models;
mod repository;
mod store;

pub use models::*;
pub use repository::*;
pub use store::*;
