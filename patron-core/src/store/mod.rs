//! Store implementations.

/// Postgres production store.
pub mod pg;

pub use pg::PgStore;
