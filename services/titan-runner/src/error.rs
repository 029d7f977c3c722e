//! Per-account failure types

use thiserror::Error;

/// Why an account's pipeline stopped for good.
///
/// These never propagate past the supervisor: each is logged with the
/// account label, counted under its [`reason`](AccountError::reason), and
/// the remaining accounts keep running.
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("no endpoint available: {0}")]
    NoEndpointAvailable(String),

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("re-authentication failed: {0}")]
    Auth(String),
}

impl AccountError {
    /// Stable label for the `titan_account_failures_total` counter.
    pub fn reason(&self) -> &'static str {
        match self {
            AccountError::BootstrapFailed(_) => "bootstrap_failed",
            AccountError::NoEndpointAvailable(_) => "no_endpoint",
            AccountError::ReconnectExhausted { .. } => "reconnect_exhausted",
            AccountError::Auth(_) => "auth",
        }
    }
}

impl From<titan_stream::Error> for AccountError {
    fn from(err: titan_stream::Error) -> Self {
        match err {
            titan_stream::Error::ReconnectExhausted { attempts } => {
                AccountError::ReconnectExhausted { attempts }
            }
            titan_stream::Error::Auth(msg) | titan_stream::Error::Unauthorized(msg) => {
                AccountError::Auth(msg)
            }
            // Handled inside the session; surfacing here means no endpoint stayed usable
            other @ (titan_stream::Error::Transport(_) | titan_stream::Error::Protocol(_)) => {
                AccountError::NoEndpointAvailable(other.to_string())
            }
        }
    }
}

impl From<titan_endpoints::Error> for AccountError {
    fn from(err: titan_endpoints::Error) -> Self {
        AccountError::NoEndpointAvailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_distinct() {
        let errors = [
            AccountError::BootstrapFailed("x".into()),
            AccountError::NoEndpointAvailable("x".into()),
            AccountError::ReconnectExhausted { attempts: 6 },
            AccountError::Auth("x".into()),
        ];
        let mut reasons: Vec<_> = errors.iter().map(AccountError::reason).collect();
        reasons.sort_unstable();
        reasons.dedup();
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn stream_exhaustion_keeps_attempt_count() {
        let err = AccountError::from(titan_stream::Error::ReconnectExhausted { attempts: 6 });
        assert!(matches!(err, AccountError::ReconnectExhausted { attempts: 6 }));
        assert_eq!(err.to_string(), "gave up after 6 reconnect attempts");
    }

    #[test]
    fn stream_auth_failure_maps_to_auth() {
        let err = AccountError::from(titan_stream::Error::Auth("refresh denied".into()));
        assert!(matches!(err, AccountError::Auth(ref m) if m == "refresh denied"));
        assert_eq!(err.reason(), "auth");
    }

    #[test]
    fn endpoint_errors_map_to_no_endpoint() {
        let err = AccountError::from(titan_endpoints::Error::NoEndpointAvailable(
            "all 4 pool endpoints unreachable".into(),
        ));
        assert_eq!(err.reason(), "no_endpoint");
        assert!(err.to_string().contains("all 4 pool endpoints unreachable"));
    }
}
