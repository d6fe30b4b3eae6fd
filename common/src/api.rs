//! API definitions shared between the patron server, the orchestration core,
//! and (eventually) internal tooling clients.

/// Serializable API error types and error kinds.
pub mod error;
/// Structs sent across the wire.
pub mod models;
