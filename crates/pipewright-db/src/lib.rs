//! Persistence layer for pipewright.
//!
//! Jobs, steps and YAML snapshots are stored as independent documents;
//! writes are not transactional across documents.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;
