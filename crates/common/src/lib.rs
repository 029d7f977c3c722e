//! Types shared by every Titan node crate

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
