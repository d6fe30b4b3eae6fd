//! Utilities shared by tests across crate boundaries. Gated behind
//! `#[cfg(any(test, feature = "test-utils"))]`.

/// Common proptest strategies.
pub mod arbitrary;
/// Serde roundtrip proptest helpers.
pub mod roundtrip;
