//! The patron API server: a thin axum layer over the orchestration core.

/// Admin session tokens.
pub mod auth;
/// Command line interface.
pub mod cli;
/// Environment configuration.
pub mod config;
/// Routes and handlers.
pub mod routes;
/// Server startup and shutdown wiring.
pub mod run;
