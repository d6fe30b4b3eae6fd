//! Serializable api error types and error kinds returned by the patron
//! service.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::fmt;

use http::StatusCode as Status;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: Status = Status::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: Status = Status::UNAUTHORIZED;
pub const CLIENT_404_NOT_FOUND: Status = Status::NOT_FOUND;
pub const CLIENT_409_CONFLICT: Status = Status::CONFLICT;
pub const SERVER_500_INTERNAL_SERVER_ERROR: Status =
    Status::INTERNAL_SERVER_ERROR;
pub const SERVER_502_BAD_GATEWAY: Status = Status::BAD_GATEWAY;

/// `ErrorCode` is the common serialized representation for all error kinds.
pub type ErrorCode = u16;

/// `ErrorResponse` is the common JSON-serialized representation for all API
/// errors. It is the only error struct actually sent across the wire.
/// Everything else is converted to / from it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub msg: String,
}

/// Get the HTTP status code returned for a particular error.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> Status;
}

/// The set of methods and traits derived by the `error_kind!` macro.
///
/// Try to keep this light, since debugging macros is a pain : )
pub trait ErrorKindGenerated:
    Copy
    + Clone
    + Default
    + Eq
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + From<ErrorCode>
    + Sized
    + 'static
{
    /// An array of all known error kind variants, excluding `Unknown(_)`.
    const KINDS: &'static [Self];

    /// Returns `true` if the error kind is unrecognized (at least by this
    /// version of the software).
    fn is_unknown(&self) -> bool;

    /// Returns the variant name of this error kind.
    fn to_name(self) -> &'static str;

    /// Returns the human-readable message for this error kind. For a
    /// generated error kind, this is the same as the variant's doc string.
    fn to_msg(self) -> &'static str;

    /// Returns the serializable [`ErrorCode`] for this error kind.
    fn to_code(self) -> ErrorCode;

    /// Returns the error kind for this raw [`ErrorCode`].
    ///
    /// This method is infallible as every error kind must always have an
    /// `Unknown(_)` variant for backwards compatibility.
    fn from_code(code: ErrorCode) -> Self;
}

/// This macro takes an error kind enum declaration and generates impls for
/// the trait [`ErrorKindGenerated`] (and its dependent traits).
///
/// * All error kind types _must_ have an `Unknown(ErrorCode)` variant and it
///   _must_ be first. This handles any unrecognized errors seen from remote
///   services and preserves the error code for debugging / propagating.
///
/// * Doc strings on the error variants are used for
///   [`ErrorKindGenerated::to_msg`] and the [`fmt::Display`] impl.
#[macro_export]
macro_rules! error_kind {
    {
        $(#[$enum_meta:meta])*
        pub enum $error_kind_name:ident {
            $( #[doc = $unknown_msg:literal] )*
            Unknown(ErrorCode),

            $(
                // use the doc string for the error message
                $( #[doc = $item_msg:literal] )*
                $item_name:ident = $item_code:literal
            ),*

            $(,)?
        }
    } => { // generate the error kind enum + impls

        $(#[$enum_meta])*
        pub enum $error_kind_name {
            $( #[doc = $unknown_msg] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg] )*
                $item_name
            ),*
        }

        // --- macro-generated impls --- //

        impl $crate::api::error::ErrorKindGenerated for $error_kind_name {
            const KINDS: &'static [Self] = &[
                $( Self::$item_name, )*
            ];

            #[inline]
            fn is_unknown(&self) -> bool {
                matches!(self, Self::Unknown(_))
            }

            fn to_name(self) -> &'static str {
                match self {
                    $( Self::$item_name => stringify!($item_name), )*
                    Self::Unknown(_) => "Unknown",
                }
            }

            fn to_msg(self) -> &'static str {
                match self {
                    $( Self::$item_name => concat!($( $item_msg, )*), )*
                    Self::Unknown(_) => concat!($( $unknown_msg, )*),
                }
            }

            fn to_code(self) -> $crate::api::error::ErrorCode {
                match self {
                    $( Self::$item_name => $item_code, )*
                    Self::Unknown(code) => code,
                }
            }

            fn from_code(code: $crate::api::error::ErrorCode) -> Self {
                // this deny attr makes duplicate codes a compile error : )
                #[deny(unreachable_patterns)]
                match code {
                    // make 0 the first entry so any variants with 0 code will
                    // raise a compile error.
                    0 => Self::Unknown(0),
                    $( $item_code => Self::$item_name, )*
                    _ => Self::Unknown(code),
                }
            }
        }

        // --- standard trait impls --- //

        impl Default for $error_kind_name {
            fn default() -> Self {
                Self::Unknown(0)
            }
        }

        impl ::std::fmt::Display for $error_kind_name {
            fn fmt(
                &self,
                f: &mut ::std::fmt::Formatter<'_>,
            ) -> ::std::fmt::Result {
                use $crate::api::error::ErrorKindGenerated;
                let name = (*self).to_name();
                let msg = (*self).to_msg();
                let code = (*self).to_code();
                // ex: "[6=ProviderUnavailable] Provider is unavailable"
                write!(f, "[{code}={name}]{msg}")
            }
        }

        // --- impl Into/From ErrorCode --- //

        impl From<$crate::api::error::ErrorCode> for $error_kind_name {
            #[inline]
            fn from(code: $crate::api::error::ErrorCode) -> Self {
                use $crate::api::error::ErrorKindGenerated;
                Self::from_code(code)
            }
        }

        impl From<$error_kind_name> for $crate::api::error::ErrorCode {
            #[inline]
            fn from(val: $error_kind_name) -> $crate::api::error::ErrorCode {
                use $crate::api::error::ErrorKindGenerated;
                val.to_code()
            }
        }

        // --- impl Arbitrary --- //

        // Unfortunately, we can't just derive Arbitrary since proptest will
        // generate `Unknown(code)` with code that actually is a valid
        // variant.
        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $error_kind_name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;

            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::arbitrary::any;
                use proptest::strategy::Strategy;
                use proptest::{prop_oneof, sample};
                use $crate::api::error::ErrorKindGenerated;

                // 9/10 sample a valid error code, o/w sample a random error
                // code (likely unknown).
                prop_oneof![
                    9 => sample::select(Self::KINDS),
                    1 => any::<$crate::api::error::ErrorCode>()
                        .prop_map(Self::from_code),
                ].boxed()
            }
        }
    }
}

// --- Error structs --- //

/// The primary error type that the patron service returns.
#[derive(Error, Clone, Debug, Eq, PartialEq, Hash)]
#[error("{kind}: {msg}")]
pub struct CoreApiError {
    pub kind: CoreErrorKind,
    pub msg: String,
}

error_kind! {
    /// All variants of errors that the payments core can return.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum CoreErrorKind {
        /// Unknown error
        Unknown(ErrorCode),

        /// Request was malformed or violated a business rule
        InvalidRequest = 1,
        /// Caller failed authentication
        Unauthorized = 2,
        /// Webhook signature verification failed
        SignatureInvalid = 3,
        /// Resource not found
        NotFound = 4,
        /// Resource already exists or transition already applied
        Conflict = 5,
        /// Payment provider is temporarily unavailable
        ProviderUnavailable = 6,
        /// Payment provider rejected the request permanently
        ProviderPermanent = 7,
        /// Unexpected internal error
        Internal = 8,
    }
}

impl CoreApiError {
    fn new(kind: CoreErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidRequest, msg)
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Unauthorized, msg)
    }
    pub fn signature_invalid(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::SignatureInvalid, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Conflict, msg)
    }
    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ProviderUnavailable, msg)
    }
    pub fn provider_permanent(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ProviderPermanent, msg)
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, msg)
    }

    /// Whether a retry scheduler should re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            CoreErrorKind::ProviderUnavailable
                | CoreErrorKind::Internal
                | CoreErrorKind::Unknown(_)
        )
    }
}

impl From<anyhow::Error> for CoreApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<CoreApiError> for ErrorResponse {
    fn from(err: CoreApiError) -> Self {
        Self {
            code: err.kind.to_code(),
            msg: err.msg,
        }
    }
}

impl From<ErrorResponse> for CoreApiError {
    fn from(resp: ErrorResponse) -> Self {
        Self {
            kind: CoreErrorKind::from_code(resp.code),
            msg: resp.msg,
        }
    }
}

impl ToHttpStatus for CoreApiError {
    fn to_http_status(&self) -> Status {
        use CoreErrorKind::*;
        match self.kind {
            Unknown(_) => SERVER_500_INTERNAL_SERVER_ERROR,
            InvalidRequest => CLIENT_400_BAD_REQUEST,
            Unauthorized => CLIENT_401_UNAUTHORIZED,
            SignatureInvalid => CLIENT_400_BAD_REQUEST,
            NotFound => CLIENT_404_NOT_FOUND,
            Conflict => CLIENT_409_CONFLICT,
            ProviderUnavailable => SERVER_502_BAD_GATEWAY,
            ProviderPermanent => SERVER_502_BAD_GATEWAY,
            Internal => SERVER_500_INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn error_code_roundtrip() {
        proptest!(|(kind: CoreErrorKind)| {
            let code = kind.to_code();
            prop_assert_eq!(CoreErrorKind::from_code(code), kind);
        })
    }

    #[test]
    fn kind_messages_nonempty() {
        for kind in CoreErrorKind::KINDS {
            assert!(!kind.to_msg().is_empty());
            assert!(!kind.is_unknown());
        }
    }

    #[test]
    fn conflict_is_not_retryable() {
        assert!(!CoreApiError::conflict("dup").is_retryable());
        assert!(CoreApiError::provider_unavailable("503").is_retryable());
        assert!(!CoreApiError::provider_permanent("gone").is_retryable());
    }
}
