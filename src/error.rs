//! Error types for the purchases core

use thiserror::Error;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchasesErrorCode {
    /// A blank app user id was passed to an identity operation
    InvalidAppUserId,
    /// Log out was requested while the current user is anonymous
    LogOutAnonymousUser,
    /// Enforced verification rejected a response
    SignatureVerificationFailed,
    /// The request never produced an HTTP response
    Network,
    /// The server answered with a non-success status
    Backend,
    /// The persisted key/value store could not be read or written
    Storage,
    /// A payload could not be encoded or decoded
    Serialization,
    /// Options or environment were invalid
    Configuration,
}

impl std::fmt::Display for PurchasesErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidAppUserId => "INVALID_APP_USER_ID",
            Self::LogOutAnonymousUser => "LOG_OUT_ANONYMOUS_USER",
            Self::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            Self::Network => "NETWORK_ERROR",
            Self::Backend => "BACKEND_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
        };
        f.write_str(s)
    }
}

/// Error returned by every fallible operation in this crate.
///
/// Network and backend errors are passed through from the transport
/// unchanged, so callers can inspect `status` to tell a rejected request
/// from one that never reached the server.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct PurchasesError {
    pub code: PurchasesErrorCode,
    pub message: String,
    /// HTTP status, when the error came from a server response
    pub status: Option<u16>,
}

impl PurchasesError {
    pub fn new(code: PurchasesErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(code: PurchasesErrorCode, message: impl Into<String>, status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn invalid_app_user_id() -> Self {
        Self::new(
            PurchasesErrorCode::InvalidAppUserId,
            "app user id must not be blank",
        )
    }

    pub fn log_out_anonymous_user() -> Self {
        Self::new(
            PurchasesErrorCode::LogOutAnonymousUser,
            "called log out but the current user is anonymous",
        )
    }

    pub fn signature_verification_failed(path: &str) -> Self {
        Self::new(
            PurchasesErrorCode::SignatureVerificationFailed,
            format!("signature verification failed for {}", path),
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(PurchasesErrorCode::Network, message)
    }

    pub fn backend(status: u16, message: impl Into<String>) -> Self {
        Self::with_status(PurchasesErrorCode::Backend, message, status)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(PurchasesErrorCode::Storage, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(PurchasesErrorCode::Configuration, message)
    }

    /// True when the server received the request and rejected it (4xx).
    ///
    /// Attribute uploads that fail this way will never succeed on retry.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status, Some(s) if (400..500).contains(&s))
    }
}

impl From<serde_json::Error> for PurchasesError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(PurchasesErrorCode::Serialization, e.to_string())
    }
}

impl From<reqwest::Error> for PurchasesError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::backend(status.as_u16(), e.to_string()),
            None => Self::network(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PurchasesError>;
