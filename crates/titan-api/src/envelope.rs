//! The `{code, msg, data}` response envelope
//!
//! Node endpoints answer with `code == 0` on success and a non-zero code
//! plus a human-readable `msg` on application-level rejection. A few
//! endpoints answer with a bare object; those fields land in `extra`.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Parse a response body. An empty body is an empty envelope.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty());
        }
        serde_json::from_slice(body).map_err(|e| Error::Decode(format!("envelope: {e}")))
    }

    fn empty() -> Self {
        Self {
            code: None,
            msg: None,
            data: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Missing `code` counts as success (bare-object endpoints).
    pub fn is_ok(&self) -> bool {
        self.code.unwrap_or(0) == 0
    }

    /// Server message, or a placeholder.
    pub fn message(&self) -> String {
        self.msg
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| String::from("Unknown error"))
    }

    /// Turn a non-zero `code` into [`Error::Rejected`].
    pub fn ensure_ok(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Rejected {
                code: self.code.unwrap_or_default(),
                message: self.message(),
            })
        }
    }

    /// `data` when present, otherwise the remaining top-level fields.
    pub fn payload(&self) -> serde_json::Value {
        match &self.data {
            Some(data) => data.clone(),
            None => serde_json::Value::Object(self.extra.clone()),
        }
    }

    /// Deserialize the payload into `T`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.payload())
            .map_err(|e| Error::Decode(format!("response data: {e}")))
    }
}
