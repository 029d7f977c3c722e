//! Script integrity check

use sha2::{Digest, Sha256};

use crate::descriptor::JobDescriptor;
use crate::error::{Error, Result};

/// A job whose script matched its declared digest.
#[derive(Debug, Clone)]
pub struct VerifiedJob {
    pub descriptor: JobDescriptor,
    pub script: Vec<u8>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Compare the script digest with the declared hash (case-insensitive).
pub fn verify_script(descriptor: JobDescriptor, script: Vec<u8>) -> Result<VerifiedJob> {
    let actual = sha256_hex(&script);
    let expected = descriptor.script_hash.trim();
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::Integrity {
            job_id: descriptor.id,
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(VerifiedJob { descriptor, script })
}
