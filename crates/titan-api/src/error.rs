//! Error types for node API operations

/// Errors from node API operations.
///
/// `RefreshDenied`, `LoginDenied` and `Unauthorized` form the auth family
/// (see [`Error::is_auth`]); they escalate to the account supervisor.
/// `Transport` is connection-level and retryable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request rejected (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("refresh denied: {0}")]
    RefreshDenied(String),

    #[error("login denied: {0}")]
    LoginDenied(String),

    #[error("device registration failed: {0}")]
    Registration(String),

    #[error("account store error: {0}")]
    Store(String),
}

impl Error {
    /// Refresh/login denial or a 401-equivalent rejection.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Error::RefreshDenied(_) | Error::LoginDenied(_) | Error::Unauthorized(_)
        )
    }

    /// Connection-level failure: no usable answer from the server at all,
    /// or a gateway/server error that says nothing about the request itself.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status { status, .. } => {
                crate::classify_status(*status) == crate::StatusClass::Transient
            }
            _ => false,
        }
    }
}

/// Result alias for API operations.
pub type Result<T> = std::result::Result<T, Error>;
