//! Persistent stream session for one account
//!
//! Owns the WebSocket to a node: handshake, keepalive PING/PONG, inbound
//! dispatch, and reconnect with exponential backoff across the account's
//! endpoint pool. The lifecycle is a pure state machine ([`state`]); the
//! driver in [`session`] executes the I/O each transition asks for.
//!
//! Session lifecycle:
//! 1. `Disconnected` → `Connecting` on start or when a reconnect delay elapses
//! 2. `Connecting` → `Authenticated` on a successful open (attempt counter reset)
//! 3. Any failure → `Disconnected` with `base * 2^attempt` delay, rotating endpoints
//! 4. Attempt counter above the maximum → `ReconnectExhausted`
//! 5. Shutdown → `Closing` from any state; nothing is rescheduled afterwards

pub mod backoff;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use error::{Error, Result};
pub use hooks::{JobSync, NoJobs, NoopObserver, StreamObserver, SyncOutcome};
pub use protocol::{Frame, JobReport, PointsUpdate};
pub use session::{SessionConfig, SessionContext, StreamSession};
pub use state::{SessionAction, SessionEvent, SessionState, handle_event};
