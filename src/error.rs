use std::sync::Arc;

use crate::handle::HandleKind;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while crossing the handle boundary.
///
/// Note that a truncated copy into a caller-supplied buffer is not an error. See
/// [`Bridge::get_client_init_response_into`](crate::Bridge::get_client_init_response_into).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The token does not resolve to a live object of the expected kind. Returned for zero,
    /// wrong-kind, stale (already released), and never-minted tokens.
    #[error("invalid {kind} handle")]
    InvalidHandle {
        /// The kind of handle the operation expected.
        kind: HandleKind,
    },

    /// A caller-supplied value cannot be used (empty SDK key, malformed JSON in user fields).
    #[error("malformed {field}: {reason}")]
    MalformedInput {
        /// Name of the offending input.
        field: &'static str,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Client initialization has not completed yet.
    #[error("client is not initialized yet")]
    NotReady,

    /// Invalid specs URL configuration.
    #[error("invalid specs_url configuration")]
    InvalidSpecsUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The specs payload could not be parsed.
    #[error("error parsing specs response")]
    SpecsParse(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// The first specs request did not finish within
    /// [`Options::init_timeout`](crate::Options::init_timeout).
    #[error("initialization timed out")]
    InitTimeout,

    /// The background initialization thread panicked. This should normally never happen.
    #[error("initialization thread panicked")]
    InitializerPanicked,

    /// No more handles of the given kind can be minted.
    #[error("handle table for {kind} is full")]
    RegistryFull {
        /// The kind of handle that could not be minted.
        kind: HandleKind,
    },
}

impl Error {
    pub(crate) fn malformed(field: &'static str, reason: impl ToString) -> Error {
        Error::MalformedInput {
            field,
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::SpecsParse(Arc::new(value))
    }
}
