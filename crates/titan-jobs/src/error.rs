//! Error types for job sync

/// Errors from job sync.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Downloaded script does not match its declared hash; the job is dropped.
    #[error("job {job_id}: script digest {actual} does not match declared {expected}")]
    Integrity {
        job_id: String,
        expected: String,
        actual: String,
    },

    #[error("fetching script: {0}")]
    Fetch(String),

    #[error("listing jobs: {0}")]
    Listing(String),

    /// The node rejected the access credential on a listing or fetch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl Error {
    /// Lift an API error, keeping auth rejections distinct.
    pub(crate) fn from_api(err: titan_api::Error, wrap: fn(String) -> Error) -> Self {
        if err.is_auth() {
            Error::Unauthorized(err.to_string())
        } else {
            wrap(err.to_string())
        }
    }
}

/// Result alias for job operations.
pub type Result<T> = std::result::Result<T, Error>;
