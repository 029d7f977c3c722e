//! Error types for endpoint selection

/// Errors from endpoint selection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every pool entry and discovery candidate failed its probe.
    #[error("no endpoint available: {0}")]
    NoEndpointAvailable(String),

    #[error("endpoint pool is empty")]
    EmptyPool,

    #[error("harbor discovery failed: {0}")]
    Discovery(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;
