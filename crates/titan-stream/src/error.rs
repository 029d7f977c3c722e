//! Error types for the stream session

/// Errors from the stream session.
///
/// `Transport` and `Protocol` are handled inside the session (reconnect or
/// discard). Only `ReconnectExhausted` and `Auth` end a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream transport error: {0}")]
    Transport(String),

    /// Handshake refused with 401/403.
    #[error("stream handshake unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("re-authentication failed: {0}")]
    Auth(String),
}

/// Result alias for stream operations.
pub type Result<T> = std::result::Result<T, Error>;
