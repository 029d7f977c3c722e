//! Stream frame codec
//!
//! Frames are JSON objects. Control frames carry a numeric `cmd`:
//! `1` PING `{echo, jobReport}`, `2` PONG `{echo}`, `3` jobs changed.
//! Point-balance updates arrive as `{"userDataUpdate": {...}}` with no `cmd`.
//! Unknown commands decode to [`Frame::Unknown`]; non-JSON or non-object
//! payloads are a protocol error the caller discards.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

pub const CMD_PING: i64 = 1;
pub const CMD_PONG: i64 = 2;
pub const CMD_JOBS_CHANGED: i64 = 3;

/// Job counts carried in every keepalive PING.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Jobs listed in the last sync
    #[serde(rename = "cfgcnt")]
    pub config_count: u32,
    /// Jobs verified and dispatched in the last sync
    #[serde(rename = "jobcnt")]
    pub job_count: u32,
}

/// Point balances pushed by the node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PointsUpdate {
    #[serde(default, deserialize_with = "lenient_number")]
    pub today_points: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total_points: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The echo token is kept as raw JSON so a PONG returns it unchanged.
    Ping {
        echo: Value,
        job_report: Option<JobReport>,
    },
    Pong {
        echo: Value,
    },
    JobsChanged,
    PointsUpdate(PointsUpdate),
    /// Unrecognized command or untagged object
    Unknown(Option<i64>),
}

impl Frame {
    pub fn ping(echo: impl Into<Value>, job_report: JobReport) -> Self {
        Frame::Ping {
            echo: echo.into(),
            job_report: Some(job_report),
        }
    }

    pub fn pong(echo: Value) -> Self {
        Frame::Pong { echo }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(Error::Protocol("frame is not a JSON object".into()));
        };

        if let Some(cmd) = object.get("cmd") {
            let cmd = cmd
                .as_i64()
                .ok_or_else(|| Error::Protocol(format!("non-integer cmd: {cmd}")))?;
            let echo = object.remove("echo").unwrap_or(Value::Null);
            return Ok(match cmd {
                CMD_PING => Frame::Ping {
                    echo,
                    job_report: object
                        .remove("jobReport")
                        .and_then(|r| serde_json::from_value(r).ok()),
                },
                CMD_PONG => Frame::Pong { echo },
                CMD_JOBS_CHANGED => Frame::JobsChanged,
                other => Frame::Unknown(Some(other)),
            });
        }

        if let Some(update) = object.remove("userDataUpdate") {
            let update =
                serde_json::from_value(update).map_err(|e| Error::Protocol(e.to_string()))?;
            return Ok(Frame::PointsUpdate(update));
        }

        Ok(Frame::Unknown(None))
    }

    /// Encode an outbound frame. Only PING and PONG are ever sent.
    pub fn encode(&self) -> Option<String> {
        let value = match self {
            Frame::Ping { echo, job_report } => {
                json!({ "cmd": CMD_PING, "echo": echo, "jobReport": job_report.unwrap_or_default() })
            }
            Frame::Pong { echo } => json!({ "cmd": CMD_PONG, "echo": echo }),
            _ => return None,
        };
        Some(value.to_string())
    }
}

/// Points arrive as numbers or numeric strings depending on server version.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
