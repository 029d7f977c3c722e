//! HTTP status classification for node API responses
//!
//! Decides whether a failed call should be retried elsewhere (transient),
//! answered with a credential refresh (unauthorized), or logged and
//! accepted as the server's final word (rejected).

/// Coarse outcome of an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// 401/403: the access credential must be refreshed before reuse
    Unauthorized,
    /// 408, 429 and 5xx: the endpoint is struggling, not the request
    Transient,
    /// Any other client error
    Rejected,
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::Unauthorized,
        408 | 429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Rejected,
    }
}
