//! Job sync for the stream session
//!
//! When the node signals that its job set changed, [`JobSyncer`] lists the
//! account's jobs, downloads each script and checks its SHA-256 digest
//! against the declared hash. Only verified scripts reach the
//! [`JobExecutor`]; the default [`LogOnlyExecutor`] records them and
//! never runs anything.

pub mod descriptor;
pub mod error;
pub mod executor;
pub mod syncer;
pub mod verify;

pub use descriptor::{JobDescriptor, list_jobs};
pub use error::{Error, Result};
pub use executor::{JobExecutor, LogOnlyExecutor};
pub use syncer::JobSyncer;
pub use verify::{VerifiedJob, sha256_hex, verify_script};
