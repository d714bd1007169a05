//! Database module: row models and SQL repositories.
//!
//! - `model`: row mapping and aggregate views returned by repositories.
//! - `repo`: SQL-only functions for the queue table and the streams table.
//!
//! Callers import from `stream_queue::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::StatusCounts;
