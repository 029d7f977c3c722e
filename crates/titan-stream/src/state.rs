//! Stream session state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The driver in `session.rs` executes the I/O implied by each action.
//!
//! Every failure (open failed, connection lost) increments the attempt
//! counter; a successful open resets it. `Closing` and `Exhausted` are
//! terminal and absorb every later event, so a close arriving after
//! shutdown cannot schedule a reconnect.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected { attempt: u32 },
    Connecting { attempt: u32 },
    Authenticated,
    Closing,
    Exhausted { attempts: u32 },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected { .. } => "disconnected",
            SessionState::Connecting { .. } => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Closing => "closing",
            SessionState::Exhausted { .. } => "exhausted",
        }
    }

    /// Current reconnect-attempt counter.
    pub fn attempt(&self) -> u32 {
        match self {
            SessionState::Disconnected { attempt } | SessionState::Connecting { attempt } => {
                *attempt
            }
            SessionState::Exhausted { attempts } => *attempts,
            SessionState::Authenticated | SessionState::Closing => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Exhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Opened,
    OpenFailed,
    ConnectionLost,
    /// Reconnect delay elapsed
    RetryElapsed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a connection; rotate to the next endpoint first when set
    Connect { rotate: bool },
    /// Connection is up: run keepalive and the read loop
    StartKeepalive,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    GiveUp { attempts: u32 },
    /// Cancel timers and close the connection
    Stop,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: SessionState,
    event: SessionEvent,
    policy: &ReconnectPolicy,
) -> (SessionState, SessionAction) {
    match (state, event) {
        // --- Terminal states absorb everything ---
        (state @ (SessionState::Closing | SessionState::Exhausted { .. }), _) => {
            (state, SessionAction::None)
        }

        (_, SessionEvent::Shutdown) => (SessionState::Closing, SessionAction::Stop),

        // --- Disconnected ---
        (SessionState::Disconnected { attempt }, SessionEvent::Start) => (
            SessionState::Connecting { attempt },
            SessionAction::Connect { rotate: false },
        ),
        (SessionState::Disconnected { attempt }, SessionEvent::RetryElapsed) => (
            SessionState::Connecting { attempt },
            SessionAction::Connect { rotate: true },
        ),

        // --- Connecting ---
        (SessionState::Connecting { .. }, SessionEvent::Opened) => {
            (SessionState::Authenticated, SessionAction::StartKeepalive)
        }
        (SessionState::Connecting { attempt }, SessionEvent::OpenFailed) => fail(attempt, policy),

        // --- Authenticated ---
        (SessionState::Authenticated, SessionEvent::ConnectionLost) => fail(0, policy),

        // --- Everything else is a no-op ---
        (state, _) => (state, SessionAction::None),
    }
}

fn fail(previous: u32, policy: &ReconnectPolicy) -> (SessionState, SessionAction) {
    let attempt = previous.saturating_add(1);
    if policy.should_give_up(attempt) {
        (
            SessionState::Exhausted { attempts: attempt },
            SessionAction::GiveUp { attempts: attempt },
        )
    } else {
        (
            SessionState::Disconnected { attempt },
            SessionAction::ScheduleReconnect {
                delay: policy.delay_for_attempt(attempt),
                attempt,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(5), 5)
    }

    fn start() -> SessionState {
        let (state, action) =
            handle_event(SessionState::Disconnected { attempt: 0 }, SessionEvent::Start, &policy());
        assert_eq!(action, SessionAction::Connect { rotate: false });
        state
    }

    #[test]
    fn open_transitions_to_authenticated_and_starts_keepalive() {
        let (state, action) = handle_event(start(), SessionEvent::Opened, &policy());
        assert_eq!(state, SessionState::Authenticated);
        assert_eq!(action, SessionAction::StartKeepalive);
    }

    #[test]
    fn open_failure_schedules_backoff_from_attempt_one() {
        let (state, action) = handle_event(start(), SessionEvent::OpenFailed, &policy());
        assert_eq!(state, SessionState::Disconnected { attempt: 1 });
        assert_eq!(
            action,
            SessionAction::ScheduleReconnect {
                delay: Duration::from_secs(10),
                attempt: 1
            }
        );
    }

    #[test]
    fn retry_elapsed_reconnects_with_rotation() {
        let (state, action) = handle_event(
            SessionState::Disconnected { attempt: 2 },
            SessionEvent::RetryElapsed,
            &policy(),
        );
        assert_eq!(state, SessionState::Connecting { attempt: 2 });
        assert_eq!(action, SessionAction::Connect { rotate: true });
    }

    #[test]
    fn successful_open_resets_attempt_counter() {
        let (state, _) = handle_event(
            SessionState::Connecting { attempt: 4 },
            SessionEvent::Opened,
            &policy(),
        );
        assert_eq!(state.attempt(), 0);

        let (state, action) = handle_event(state, SessionEvent::ConnectionLost, &policy());
        assert_eq!(state, SessionState::Disconnected { attempt: 1 });
        assert!(matches!(action, SessionAction::ScheduleReconnect { attempt: 1, .. }));
    }

    #[test]
    fn six_consecutive_failures_with_max_five_give_up() {
        let policy = policy();
        let mut state = start();
        let mut delays = Vec::new();

        loop {
            let (next, action) = handle_event(state, SessionEvent::OpenFailed, &policy);
            match action {
                SessionAction::ScheduleReconnect { delay, attempt } => {
                    assert_eq!(delay, policy.delay_for_attempt(attempt));
                    delays.push(delay);
                    let (next, action) = handle_event(next, SessionEvent::RetryElapsed, &policy);
                    assert_eq!(action, SessionAction::Connect { rotate: true });
                    state = next;
                }
                SessionAction::GiveUp { attempts } => {
                    assert_eq!(attempts, 6);
                    assert_eq!(next, SessionState::Exhausted { attempts: 6 });
                    break;
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(delays.len(), 5);
    }

    #[test]
    fn shutdown_from_any_live_state_closes() {
        for state in [
            SessionState::Disconnected { attempt: 3 },
            SessionState::Connecting { attempt: 0 },
            SessionState::Authenticated,
        ] {
            let (next, action) = handle_event(state, SessionEvent::Shutdown, &policy());
            assert_eq!(next, SessionState::Closing);
            assert_eq!(action, SessionAction::Stop);
        }
    }

    #[test]
    fn close_after_shutdown_does_not_reconnect() {
        let (state, _) =
            handle_event(SessionState::Authenticated, SessionEvent::Shutdown, &policy());
        for event in [
            SessionEvent::ConnectionLost,
            SessionEvent::OpenFailed,
            SessionEvent::RetryElapsed,
        ] {
            let (next, action) = handle_event(state.clone(), event, &policy());
            assert_eq!(next, SessionState::Closing);
            assert_eq!(action, SessionAction::None);
        }
    }

    #[test]
    fn exhausted_is_terminal() {
        let state = SessionState::Exhausted { attempts: 6 };
        assert!(state.is_terminal());
        let (next, action) = handle_event(state, SessionEvent::Start, &policy());
        assert_eq!(next, SessionState::Exhausted { attempts: 6 });
        assert_eq!(action, SessionAction::None);
    }

    #[test]
    fn opened_while_authenticated_is_ignored() {
        let (next, action) = handle_event(SessionState::Authenticated, SessionEvent::Opened, &policy());
        assert_eq!(next, SessionState::Authenticated);
        assert_eq!(action, SessionAction::None);
    }
}
