//! Titan node API constants
//!
//! Paths are relative to an endpoint's API base. The stream path is relative
//! to the endpoint's stream base.

/// Exchange a refresh credential for an access credential
pub const REFRESH_PATH: &str = "/api/auth/refresh-token";

/// Primary-credential login (email + password)
pub const LOGIN_PATH: &str = "/api/auth/login";

/// Account profile, used as the periodic liveness poll
pub const USER_INFO_PATH: &str = "/api/user/info";

/// Device registration (idempotent)
pub const REGISTER_PATH: &str = "/api/webnodes/register";

/// Job listing for the job-sync collaborator
pub const JOBS_PATH: &str = "/api/websockets/jobs";

/// Persistent stream endpoint
pub const STREAM_PATH: &str = "/api/public/webnodes/ws";

/// Harbor discovery, relative to a bootstrap base URL
pub const HARBOR_DISCOVER_PATH: &str = "/api/harbor/discover";

/// Extension version reported in the device descriptor
pub const EXT_VERSION: &str = "0.0.4";

/// Locale reported in the device descriptor
pub const LANGUAGE: &str = "en";

/// Default User-Agent when the config does not override it
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
