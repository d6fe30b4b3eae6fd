//! The `common` crate contains types and functionality shared between the
//! patron server and the payments orchestration core.

// Ignore this issue with `proptest_derive::Arbitrary`.
#![allow(clippy::arc_with_non_send_sync)]

// Some re-exports to prevent having to re-declare dependencies
pub use secrecy::{ExposeSecret, Secret};

/// API definitions, errors, and structs sent across the wire.
pub mod api;
/// Exponential backoff.
pub mod backoff;
/// Application-level constants.
pub mod constants;
/// `DeployEnv`.
pub mod env;
/// Currency codes and minor-unit money conversions.
pub mod money;
/// Encryption for PII at rest.
pub mod pii;
/// `ShutdownChannel`.
pub mod shutdown;
/// `PtTask`.
pub mod task;
/// `TimestampMs`.
pub mod time;
/// HMAC-signed manage/cancel tokens and webhook signature verification.
pub mod tokens;

/// Feature-gated test utilities that can be shared across crate boundaries.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Assert at compile time that a boolean expression evaluates to true.
/// Implementation copied from the static_assertions crate.
#[macro_export]
macro_rules! const_assert {
    ($x:expr $(,)?) => {
        #[allow(clippy::const_is_empty, clippy::eq_op, unknown_lints)]
        const _: [(); 0 - !{
            const CONST_ASSERT: bool = $x;
            CONST_ASSERT
        } as usize] = [];
    };
}

/// A trait which allows us to apply any function to a value in a chain,
/// without breaking out of the method call syntax.
pub trait Apply<F, T> {
    fn apply(self, f: F) -> T;
}

impl<F, T, U> Apply<F, U> for T
where
    F: FnOnce(T) -> U,
{
    #[inline]
    fn apply(self, f: F) -> U {
        f(self)
    }
}
