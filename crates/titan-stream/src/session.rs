//! Stream session driver
//!
//! Executes the actions of the state machine in `state.rs`. One call to
//! [`StreamSession::run`] owns the account's connection for its whole
//! life: connect, keepalive, inbound dispatch, backoff, rotation.
//!
//! While a connection is up a single `select!` loop interleaves the
//! cancel token, the keepalive timer, the user-info poll and inbound
//! frames, so a PONG is always written in reply to the PING just read.
//! Job sync, user-info fetches and re-authentication are spawned off the
//! loop and report back over channels.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use reqwest::Url;
use serde_json::Value;
use common::Secret;
use titan_api::{ApiClient, CredentialManager, TrafficCounters, fetch_user_info};
use titan_endpoints::EndpointPool;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::hooks::{JobSync, StreamObserver, SyncOutcome};
use crate::protocol::Frame;
use crate::state::{SessionAction, SessionEvent, SessionState, handle_event};
use crate::transport::{Connector, WsStream, stream_url};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive: Duration,
    pub policy: ReconnectPolicy,
    /// `None` disables the user-info poll
    pub user_info_poll: Option<Duration>,
    /// Consecutive 401 → re-auth → re-poll rounds per poll interval
    pub max_auth_retries: u32,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub proxy: Option<Url>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            policy: ReconnectPolicy::default(),
            user_info_poll: Some(Duration::from_secs(300)),
            max_auth_retries: 1,
            connect_timeout: Duration::from_secs(30),
            user_agent: titan_api::DEFAULT_USER_AGENT.to_string(),
            proxy: None,
        }
    }
}

/// Per-account state the session borrows exclusively for its lifetime.
pub struct SessionContext<'a> {
    pub credentials: &'a mut CredentialManager,
    pub pool: &'a mut EndpointPool,
    pub device_id: &'a str,
}

/// How one connected period ended.
enum ConnectionEnd {
    Lost,
    Shutdown,
    AuthFailed(String),
}

/// One iteration of the connected loop.
enum Step {
    Shutdown,
    Keepalive,
    PollDue,
    PollResult(Tagged<titan_api::Result<Value>>),
    SyncFinished(Tagged<SyncOutcome>),
    Reauthenticated(Reauth),
    Inbound(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

/// Result of a spawned API call, with the bearer the call was made with.
struct Tagged<T> {
    bearer: Option<Secret<String>>,
    value: T,
}

/// Which spawned call saw the access credential rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthTrigger {
    UserInfo,
    JobSync,
}

impl AuthTrigger {
    fn as_str(self) -> &'static str {
        match self {
            AuthTrigger::UserInfo => "user_info",
            AuthTrigger::JobSync => "job_sync",
        }
    }
}

/// A finished off-loop re-authentication.
struct Reauth {
    trigger: AuthTrigger,
    credentials: CredentialManager,
    result: titan_api::Result<()>,
}

/// Capped re-authentication for one connected period.
///
/// A rejection invalidates the access credential at once; the refresh runs
/// on a clone of the credential manager so the read loop keeps answering
/// PINGs. At most one refresh is in flight.
struct Reauthenticator {
    max_retries: u32,
    retries: u32,
    in_flight: bool,
    tx: mpsc::Sender<Reauth>,
}

impl Reauthenticator {
    fn new(max_retries: u32, tx: mpsc::Sender<Reauth>) -> Self {
        Self {
            max_retries,
            retries: 0,
            in_flight: false,
            tx,
        }
    }

    /// A call with the current credential succeeded.
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn rejected(
        &mut self,
        trigger: AuthTrigger,
        used: Option<Secret<String>>,
        credentials: &mut CredentialManager,
        tasks: &CancellationToken,
        account: &str,
    ) {
        if self.in_flight {
            debug!(account, trigger = trigger.as_str(), "rejection while re-authenticating, ignored");
            return;
        }
        let replaced = match (&used, credentials.access_token()) {
            (Some(used), Some(current)) => used != current,
            _ => false,
        };
        if replaced {
            debug!(account, trigger = trigger.as_str(), "rejection of a replaced credential, ignored");
            return;
        }

        credentials.invalidate();
        if self.retries >= self.max_retries {
            error!(
                account,
                trigger = trigger.as_str(),
                retries = self.retries,
                "still unauthorized after re-authentication, waiting for next poll"
            );
            return;
        }
        self.retries += 1;
        self.in_flight = true;
        warn!(account, trigger = trigger.as_str(), attempt = self.retries, "access credential rejected, re-authenticating");

        let mut refreshed = credentials.clone();
        let tx = self.tx.clone();
        let token = tasks.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = refreshed.authenticate() => result.map(|_| ()),
            };
            let _ = tx
                .send(Reauth {
                    trigger,
                    credentials: refreshed,
                    result,
                })
                .await;
        });
    }
}

type WsSink = SplitSink<WsStream, Message>;

pub struct StreamSession {
    config: SessionConfig,
    connector: Connector,
    jobs: Arc<dyn JobSync>,
    observer: Arc<dyn StreamObserver>,
    state: SessionState,
}

impl StreamSession {
    pub fn new(
        config: SessionConfig,
        jobs: Arc<dyn JobSync>,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let connector = Connector::new(
            config.user_agent.clone(),
            config.proxy.clone(),
            config.connect_timeout,
        );
        Self {
            config,
            connector,
            jobs,
            observer,
            state: SessionState::Disconnected { attempt: 0 },
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run until shutdown (`Ok`), reconnect exhaustion or failed re-auth.
    pub async fn run(&mut self, mut ctx: SessionContext<'_>, cancel: &CancellationToken) -> Result<()> {
        let account = ctx.credentials.account().to_string();
        let mut needs_auth = ctx.credentials.access_token().is_none();
        let mut connection: Option<WsStream> = None;
        let mut action = self.transition(SessionEvent::Start, &account);

        loop {
            let event = match action {
                SessionAction::Connect { rotate } => {
                    if rotate && ctx.pool.has_alternatives() {
                        let endpoint = ctx.pool.advance().clone();
                        ctx.credentials.client_mut().set_base(endpoint.api().clone());
                        info!(account = %account, endpoint = %endpoint, "rotated to next endpoint");
                    }
                    if needs_auth {
                        if let Err(e) = self.reauthenticate(ctx.credentials).await {
                            self.state = SessionState::Closing;
                            return Err(e);
                        }
                        needs_auth = false;
                    }

                    match self.open(&ctx, cancel).await {
                        None => SessionEvent::Shutdown,
                        Some(Ok(ws)) => {
                            connection = Some(ws);
                            SessionEvent::Opened
                        }
                        Some(Err(Error::Unauthorized(reason))) => {
                            warn!(account = %account, reason = %reason, "stream handshake unauthorized, will re-authenticate");
                            ctx.credentials.invalidate();
                            needs_auth = true;
                            SessionEvent::OpenFailed
                        }
                        Some(Err(e)) => {
                            warn!(account = %account, endpoint = %ctx.pool.current(), error = %e, "stream open failed");
                            SessionEvent::OpenFailed
                        }
                    }
                }

                SessionAction::StartKeepalive => match connection.take() {
                    Some(ws) => {
                        info!(account = %account, endpoint = %ctx.pool.current(), "stream connected");
                        gauge!("titan_stream_connected", "account" => account.clone()).set(1.0);
                        self.observer.connected(ctx.pool.current());

                        let end = self.drive(ws, &mut ctx, cancel, &account).await;

                        gauge!("titan_stream_connected", "account" => account.clone()).set(0.0);
                        self.observer.disconnected();
                        // A rejection whose refresh was cut short by the drop
                        needs_auth = ctx.credentials.access_token().is_none();
                        match end {
                            ConnectionEnd::Lost => SessionEvent::ConnectionLost,
                            ConnectionEnd::Shutdown => SessionEvent::Shutdown,
                            ConnectionEnd::AuthFailed(reason) => {
                                self.state = SessionState::Closing;
                                return Err(Error::Auth(reason));
                            }
                        }
                    }
                    None => SessionEvent::ConnectionLost,
                },

                SessionAction::ScheduleReconnect { delay, attempt } => {
                    counter!("titan_stream_reconnects_total", "account" => account.clone())
                        .increment(1);
                    warn!(
                        account = %account,
                        attempt,
                        max_attempts = self.config.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "stream down, will retry"
                    );
                    self.observer.reconnecting(attempt, delay);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => SessionEvent::Shutdown,
                        _ = tokio::time::sleep(delay) => SessionEvent::RetryElapsed,
                    }
                }

                SessionAction::GiveUp { attempts } => {
                    error!(account = %account, attempts, "reconnect attempts exhausted, giving up");
                    return Err(Error::ReconnectExhausted { attempts });
                }

                SessionAction::Stop | SessionAction::None => {
                    info!(account = %account, "stream session closed");
                    return Ok(());
                }
            };

            action = self.transition(event, &account);
        }
    }

    fn transition(&mut self, event: SessionEvent, account: &str) -> SessionAction {
        let from = std::mem::replace(&mut self.state, SessionState::Closing);
        let from_label = from.label();
        let (to, action) = handle_event(from, event, &self.config.policy);
        debug!(account, from = from_label, to = to.label(), ?action, "session transition");
        self.state = to;
        action
    }

    /// Open a connection to the pool's current endpoint. `None` on cancel.
    async fn open(
        &self,
        ctx: &SessionContext<'_>,
        cancel: &CancellationToken,
    ) -> Option<Result<WsStream>> {
        let url = match ctx.credentials.access_token() {
            Some(token) => stream_url(ctx.pool.current(), token.expose(), ctx.device_id),
            None => Err(Error::Unauthorized("no access credential".into())),
        };
        let url = match url {
            Ok(url) => url,
            Err(e) => return Some(Err(e)),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.connector.connect(&url) => Some(result),
        }
    }

    async fn reauthenticate(&self, credentials: &mut CredentialManager) -> Result<()> {
        match credentials.authenticate().await {
            Ok(_) => {
                self.observer.reauthenticated(credentials);
                Ok(())
            }
            Err(e) => {
                error!(account = %credentials.account(), error = %e, "re-authentication failed");
                Err(Error::Auth(e.to_string()))
            }
        }
    }

    /// Run one connected period until the connection ends.
    async fn drive(
        &self,
        ws: WsStream,
        ctx: &mut SessionContext<'_>,
        cancel: &CancellationToken,
        account: &str,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();
        let traffic = Arc::clone(ctx.credentials.client().traffic());

        // Spawned job-sync and poll tasks die with this connection.
        let tasks = cancel.child_token();
        let _tasks_guard = tasks.clone().drop_guard();

        let period = self.config.keepalive;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poll = self.config.user_info_poll.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let (poll_tx, mut poll_rx) = mpsc::channel(4);
        let (sync_tx, mut sync_rx) = mpsc::channel(4);
        let (reauth_tx, mut reauth_rx) = mpsc::channel(1);
        let mut reauth = Reauthenticator::new(self.config.max_auth_retries, reauth_tx);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                _ = keepalive.tick() => Step::Keepalive,
                Some(done) = reauth_rx.recv() => Step::Reauthenticated(done),
                Some(result) = poll_rx.recv() => Step::PollResult(result),
                Some(outcome) = sync_rx.recv() => Step::SyncFinished(outcome),
                _ = tick_optional(&mut poll) => Step::PollDue,
                frame = stream.next() => Step::Inbound(frame),
            };

            match step {
                Step::Shutdown => {
                    let close = sink.send(Message::Close(None));
                    let _ = tokio::time::timeout(Duration::from_secs(1), close).await;
                    return ConnectionEnd::Shutdown;
                }

                Step::Keepalive => {
                    let report = self.jobs.report();
                    let frame = Frame::ping(echo_token(), report);
                    trace!(account, cfgcnt = report.config_count, jobcnt = report.job_count, "sending keepalive");
                    send_frame(&mut sink, &frame, &traffic, account).await;
                }

                Step::PollDue => {
                    reauth.reset();
                    spawn_user_info_poll(ctx.credentials.client().clone(), poll_tx.clone(), &tasks);
                }

                Step::PollResult(Tagged { value: Ok(info), .. }) => {
                    reauth.reset();
                    debug!(account, "user info refreshed");
                    self.observer.user_info(&info);
                }
                Step::PollResult(Tagged { bearer, value: Err(e) }) if e.is_auth() => {
                    warn!(account, error = %e, "user info unauthorized");
                    reauth.rejected(AuthTrigger::UserInfo, bearer, ctx.credentials, &tasks, account);
                }
                Step::PollResult(Tagged { value: Err(e), .. }) => {
                    warn!(account, error = %e, "user info poll failed");
                }

                Step::SyncFinished(Tagged { bearer, value: SyncOutcome::Done }) => {
                    if bearer.is_some() {
                        reauth.reset();
                    }
                }
                Step::SyncFinished(Tagged { bearer, value: SyncOutcome::Unauthorized }) => {
                    reauth.rejected(AuthTrigger::JobSync, bearer, ctx.credentials, &tasks, account);
                }

                Step::Reauthenticated(Reauth { trigger, credentials, result }) => {
                    reauth.in_flight = false;
                    if let Err(e) = result {
                        error!(account, error = %e, "re-authentication failed");
                        return ConnectionEnd::AuthFailed(e.to_string());
                    }
                    *ctx.credentials = credentials;
                    self.observer.reauthenticated(ctx.credentials);
                    let client = ctx.credentials.client().clone();
                    match trigger {
                        AuthTrigger::UserInfo => spawn_user_info_poll(client, poll_tx.clone(), &tasks),
                        AuthTrigger::JobSync => {
                            spawn_job_sync(Arc::clone(&self.jobs), client, sync_tx.clone(), &tasks)
                        }
                    }
                }

                Step::Inbound(Some(Ok(Message::Text(text)))) => {
                    record_received(&traffic, text.len(), account);
                    if let Some(reply) = self.dispatch(text.as_str(), ctx.credentials.client(), &sync_tx, &tasks, account) {
                        send_frame(&mut sink, &reply, &traffic, account).await;
                    }
                }
                Step::Inbound(Some(Ok(Message::Binary(bytes)))) => {
                    record_received(&traffic, bytes.len(), account);
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            if let Some(reply) = self.dispatch(text, ctx.credentials.client(), &sync_tx, &tasks, account) {
                                send_frame(&mut sink, &reply, &traffic, account).await;
                            }
                        }
                        Err(_) => warn!(account, bytes = bytes.len(), "discarding non-UTF-8 frame"),
                    }
                }
                Step::Inbound(Some(Ok(Message::Close(frame)))) => {
                    match frame {
                        Some(cf) => info!(account, code = %cf.code, reason = %cf.reason, "node closed stream"),
                        None => info!(account, "node closed stream"),
                    }
                    return ConnectionEnd::Lost;
                }
                // tungstenite answers transport-level pings itself
                Step::Inbound(Some(Ok(_))) => {}
                Step::Inbound(Some(Err(e))) => {
                    warn!(account, error = %e, "stream read failed");
                    return ConnectionEnd::Lost;
                }
                Step::Inbound(None) => {
                    info!(account, "stream ended");
                    return ConnectionEnd::Lost;
                }
            }
        }
    }

    /// Handle one inbound text frame; returns the reply to send, if any.
    fn dispatch(
        &self,
        text: &str,
        client: &ApiClient,
        sync_tx: &mpsc::Sender<Tagged<SyncOutcome>>,
        tasks: &CancellationToken,
        account: &str,
    ) -> Option<Frame> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(account, error = %e, "discarding malformed frame");
                return None;
            }
        };

        match frame {
            Frame::Ping { echo, .. } => {
                trace!(account, echo = %echo, "answering ping");
                Some(Frame::pong(echo))
            }
            Frame::Pong { echo } => {
                trace!(account, echo = %echo, "pong received");
                None
            }
            Frame::JobsChanged => {
                info!(account, "job set changed, syncing");
                spawn_job_sync(Arc::clone(&self.jobs), client.clone(), sync_tx.clone(), tasks);
                None
            }
            Frame::PointsUpdate(update) => {
                debug!(
                    account,
                    today_points = update.today_points.unwrap_or_default(),
                    total_points = update.total_points.unwrap_or_default(),
                    "points updated"
                );
                self.observer.points_updated(&update);
                None
            }
            Frame::Unknown(cmd) => {
                debug!(account, ?cmd, "ignoring unrecognized frame");
                None
            }
        }
    }
}

/// Sending on a connection that is no longer open is a no-op; the read
/// half reports the close.
async fn send_frame(sink: &mut WsSink, frame: &Frame, traffic: &TrafficCounters, account: &str) {
    let Some(text) = frame.encode() else {
        return;
    };
    let len = text.len();
    match sink.send(Message::Text(text.into())).await {
        Ok(()) => {
            traffic.record_sent(len);
            counter!("titan_stream_bytes_sent_total", "account" => account.to_string())
                .increment(len as u64);
        }
        Err(e) => debug!(account, error = %e, "send skipped, connection not open"),
    }
}

fn record_received(traffic: &TrafficCounters, len: usize, account: &str) {
    traffic.record_received(len);
    counter!("titan_stream_bytes_received_total", "account" => account.to_string())
        .increment(len as u64);
}

fn spawn_user_info_poll(
    client: ApiClient,
    tx: mpsc::Sender<Tagged<titan_api::Result<Value>>>,
    tasks: &CancellationToken,
) {
    let bearer = client.bearer().cloned();
    let token = tasks.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            value = fetch_user_info(&client) => {
                let _ = tx.send(Tagged { bearer, value }).await;
            }
        }
    });
}

fn spawn_job_sync(
    jobs: Arc<dyn JobSync>,
    client: ApiClient,
    tx: mpsc::Sender<Tagged<SyncOutcome>>,
    tasks: &CancellationToken,
) {
    let bearer = client.bearer().cloned();
    let sync = jobs.sync(client);
    let token = tasks.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            value = sync => {
                let _ = tx.send(Tagged { bearer, value }).await;
            }
        }
    });
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn echo_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use common::Secret;
    use serde_json::json;
    use titan_api::{JOBS_PATH, REFRESH_PATH, STREAM_PATH, USER_INFO_PATH};
    use titan_endpoints::Endpoint;

    use crate::hooks::{NoJobs, NoopObserver};
    use crate::protocol::{JobReport, PointsUpdate};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Fake node: refresh endpoint, user info, and a scripted stream peer.
    #[derive(Clone, Default)]
    struct Backend {
        script: Arc<Vec<String>>,
        replies: Option<mpsc::UnboundedSender<String>>,
        upgrades: Arc<AtomicUsize>,
        refreshes: Arc<AtomicUsize>,
        completed_refreshes: Arc<AtomicUsize>,
        user_info_hits: Arc<AtomicUsize>,
        job_hits: Arc<AtomicUsize>,
        /// Refreshes after the first one take this long
        slow_refresh: Option<Duration>,
        /// Sent by the peer once, this long after the script
        late_frame: Option<(Duration, String)>,
        /// First refresh hands out a token the stream rejects
        stale_first: bool,
        refresh_denied: bool,
        stream_down: bool,
    }

    impl Backend {
        fn scripted(script: &[&str]) -> (Self, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let backend = Backend {
                script: Arc::new(script.iter().map(|s| s.to_string()).collect()),
                replies: Some(tx),
                ..Default::default()
            };
            (backend, rx)
        }

        fn router(self) -> Router {
            Router::new()
                .route(REFRESH_PATH, post(refresh))
                .route(USER_INFO_PATH, get(user_info))
                .route(JOBS_PATH, get(jobs))
                .route(STREAM_PATH, get(stream))
                .with_state(self)
        }
    }

    async fn refresh(State(backend): State<Backend>) -> axum::Json<Value> {
        if backend.refresh_denied {
            return axum::Json(json!({"code": 40001, "msg": "refresh token expired"}));
        }
        let n = backend.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = backend.slow_refresh.filter(|_| n > 1) {
            tokio::time::sleep(delay).await;
        }
        backend.completed_refreshes.fetch_add(1, Ordering::SeqCst);
        let token = if backend.stale_first && n == 1 { "stale" } else { "fresh" };
        axum::Json(json!({"code": 0, "data": {"access_token": token, "user_id": "u-1"}}))
    }

    async fn jobs(State(backend): State<Backend>) -> Response {
        backend.job_hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::UNAUTHORIZED, axum::Json(json!({"code": 401, "msg": "token expired"})))
            .into_response()
    }

    async fn user_info(State(backend): State<Backend>) -> Response {
        backend.user_info_hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::UNAUTHORIZED, axum::Json(json!({"code": 401, "msg": "token expired"})))
            .into_response()
    }

    async fn stream(
        Query(query): Query<HashMap<String, String>>,
        State(backend): State<Backend>,
        ws: WebSocketUpgrade,
    ) -> Response {
        backend.upgrades.fetch_add(1, Ordering::SeqCst);
        if backend.stream_down {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        if query.get("token").map(String::as_str) != Some("fresh") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        assert_eq!(query.get("device_id").map(String::as_str), Some("dev-1"));
        ws.on_upgrade(move |socket| run_peer(socket, backend))
    }

    async fn run_peer(mut socket: WebSocket, backend: Backend) {
        for text in backend.script.iter() {
            if socket.send(AxumMessage::Text(text.clone().into())).await.is_err() {
                return;
            }
        }
        if let Some((delay, text)) = backend.late_frame.clone() {
            tokio::time::sleep(delay).await;
            if socket.send(AxumMessage::Text(text.into())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let (AxumMessage::Text(text), Some(replies)) = (msg, &backend.replies) {
                let _ = replies.send(text.to_string());
            }
        }
    }

    async fn serve(app: Router) -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Endpoint::new(&format!("http://{addr}"), &format!("ws://{addr}")).unwrap()
    }

    async fn dead_endpoint() -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::new(&format!("http://{addr}"), &format!("ws://{addr}")).unwrap()
    }

    fn credentials(endpoint: &Endpoint) -> CredentialManager {
        let client = ApiClient::new(
            reqwest::Client::new(),
            endpoint.api().clone(),
            Arc::new(TrafficCounters::new()),
        );
        CredentialManager::new("test", Secret::new("rt_test".to_string()), None, client)
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            keepalive: Duration::from_secs(60),
            policy: ReconnectPolicy::new(Duration::from_millis(1), 5),
            user_info_poll: None,
            max_auth_retries: 1,
            connect_timeout: Duration::from_secs(5),
            user_agent: "titan-test".into(),
            proxy: None,
        }
    }

    fn plain_session(config: SessionConfig) -> StreamSession {
        StreamSession::new(config, Arc::new(NoJobs), Arc::new(NoopObserver))
    }

    struct RecordingJobs {
        synced: mpsc::UnboundedSender<Option<String>>,
        report: JobReport,
    }

    impl JobSync for RecordingJobs {
        fn sync(self: Arc<Self>, client: ApiClient) -> Pin<Box<dyn Future<Output = SyncOutcome> + Send>> {
            Box::pin(async move {
                let _ = self.synced.send(client.bearer().map(|b| b.expose().clone()));
                SyncOutcome::Done
            })
        }

        fn report(&self) -> JobReport {
            self.report
        }
    }

    /// Lists jobs with whatever bearer the session hands over.
    struct ListingJobs;

    impl JobSync for ListingJobs {
        fn sync(self: Arc<Self>, client: ApiClient) -> Pin<Box<dyn Future<Output = SyncOutcome> + Send>> {
            Box::pin(async move {
                match client.get(JOBS_PATH).await {
                    Err(e) if e.is_auth() => SyncOutcome::Unauthorized,
                    _ => SyncOutcome::Done,
                }
            })
        }

        fn report(&self) -> JobReport {
            JobReport::default()
        }
    }

    struct RecordingObserver {
        points: mpsc::UnboundedSender<PointsUpdate>,
    }

    impl StreamObserver for RecordingObserver {
        fn points_updated(&self, update: &PointsUpdate) {
            let _ = self.points.send(update.clone());
        }
    }

    fn reply_json(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn answers_peer_ping_after_discarding_malformed_frames() {
        let (backend, mut replies) =
            Backend::scripted(&["not json", "[1,2]", r#"{"cmd":1,"echo":"abc-123"}"#]);
        let upgrades = backend.upgrades.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let mut session = plain_session(fast_config());
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, reply) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let reply = replies.recv().await.unwrap();
                cancel.cancel();
                reply
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(reply_json(&reply), json!({"cmd": 2, "echo": "abc-123"}));
        // Same connection answered: malformed frames did not close it
        assert_eq!(upgrades.load(Ordering::SeqCst), 1);
        assert_eq!(*session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn keepalive_ping_carries_job_report() {
        let (backend, mut replies) = Backend::scripted(&[]);
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let (synced, _synced_rx) = mpsc::unbounded_channel();
        let jobs = Arc::new(RecordingJobs {
            synced,
            report: JobReport {
                config_count: 2,
                job_count: 1,
            },
        });
        let config = SessionConfig {
            keepalive: Duration::from_millis(50),
            ..fast_config()
        };
        let mut session = StreamSession::new(config, jobs, Arc::new(NoopObserver));
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, ping) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let ping = replies.recv().await.unwrap();
                cancel.cancel();
                ping
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        let ping = reply_json(&ping);
        assert_eq!(ping["cmd"], 1);
        assert!(ping["echo"].is_string());
        assert_eq!(ping["jobReport"], json!({"cfgcnt": 2, "jobcnt": 1}));
    }

    #[tokio::test]
    async fn jobs_changed_spawns_sync_and_points_reach_observer() {
        let (backend, _replies) = Backend::scripted(&[
            r#"{"cmd":3}"#,
            r#"{"cmd":99,"whatever":true}"#,
            r#"{"userDataUpdate":{"today_points":5,"total_points":100}}"#,
        ]);
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let (synced_tx, mut synced) = mpsc::unbounded_channel();
        let (points_tx, mut points) = mpsc::unbounded_channel();
        let jobs = Arc::new(RecordingJobs {
            synced: synced_tx,
            report: JobReport::default(),
        });
        let observer = Arc::new(RecordingObserver { points: points_tx });
        let mut session = StreamSession::new(fast_config(), jobs, observer);
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, (bearer, update)) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let bearer = synced.recv().await.unwrap();
                let update = points.recv().await.unwrap();
                cancel.cancel();
                (bearer, update)
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(bearer.as_deref(), Some("fresh"));
        assert_eq!(update.today_points, Some(5.0));
        assert_eq!(update.total_points, Some(100.0));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_plus_one_failures() {
        let backend = Backend {
            stream_down: true,
            ..Default::default()
        };
        let upgrades = backend.upgrades.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let mut session = plain_session(fast_config());
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let result = tokio::time::timeout(TEST_TIMEOUT, session.run(ctx, &cancel))
            .await
            .unwrap();

        assert!(matches!(result, Err(Error::ReconnectExhausted { attempts: 6 })));
        assert_eq!(upgrades.load(Ordering::SeqCst), 6);
        assert_eq!(*session.state(), SessionState::Exhausted { attempts: 6 });
    }

    #[tokio::test]
    async fn unreachable_first_endpoint_rotates_to_second() {
        let (backend, mut replies) = Backend::scripted(&[r#"{"cmd":1,"echo":"rot"}"#]);
        let live = serve(backend.router()).await;
        let dead = dead_endpoint().await;

        let mut credentials = credentials(&live);
        credentials.refresh().await.unwrap();
        credentials.client_mut().set_base(dead.api().clone());
        let mut pool = EndpointPool::new(vec![dead, live.clone()]).unwrap();
        let mut session = plain_session(fast_config());
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, reply) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let reply = replies.recv().await.unwrap();
                cancel.cancel();
                reply
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(reply_json(&reply)["echo"], "rot");
        assert_eq!(*pool.current(), live);
        assert_eq!(credentials.client().base(), live.api());
    }

    #[tokio::test]
    async fn unauthorized_handshake_refreshes_before_reconnecting() {
        let (mut backend, mut replies) = Backend::scripted(&[r#"{"cmd":1,"echo":"after-401"}"#]);
        backend.stale_first = true;
        let refreshes = backend.refreshes.clone();
        let upgrades = backend.upgrades.clone();
        let endpoint = serve(backend.router()).await;

        let mut credentials = credentials(&endpoint);
        credentials.refresh().await.unwrap();
        assert_eq!(credentials.access_token().unwrap().expose(), "stale");
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let mut session = plain_session(fast_config());
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, reply) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let reply = replies.recv().await.unwrap();
                cancel.cancel();
                reply
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(reply_json(&reply)["echo"], "after-401");
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(upgrades.load(Ordering::SeqCst), 2);
        assert_eq!(credentials.access_token().unwrap().expose(), "fresh");
    }

    #[tokio::test]
    async fn denied_refresh_ends_session_without_stream_attempt() {
        let backend = Backend {
            refresh_denied: true,
            ..Default::default()
        };
        let upgrades = backend.upgrades.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let mut session = plain_session(fast_config());
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let result = tokio::time::timeout(TEST_TIMEOUT, session.run(ctx, &cancel))
            .await
            .unwrap();

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(upgrades.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_schedules_nothing_more() {
        let backend = Backend {
            stream_down: true,
            ..Default::default()
        };
        let upgrades = backend.upgrades.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let config = SessionConfig {
            policy: ReconnectPolicy::new(Duration::from_secs(10), 5),
            ..fast_config()
        };
        let mut session = plain_session(config);
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, ()) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                while upgrades.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(upgrades.load(Ordering::SeqCst), 1);
        assert_eq!(*session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn user_info_reauth_is_capped() {
        let (backend, _replies) = Backend::scripted(&[]);
        let refreshes = backend.refreshes.clone();
        let hits = backend.user_info_hits.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        credentials.refresh().await.unwrap();
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let config = SessionConfig {
            user_info_poll: Some(Duration::from_secs(3600)),
            max_auth_retries: 1,
            ..fast_config()
        };
        let mut session = plain_session(config);
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, ()) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                while hits.load(Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        // One refresh during setup, exactly one re-auth from the poll
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn job_sync_rejection_refreshes_before_next_use() {
        let (backend, _replies) = Backend::scripted(&[r#"{"cmd":3}"#]);
        let refreshes = backend.refreshes.clone();
        let job_hits = backend.job_hits.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        credentials.refresh().await.unwrap();
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let mut session = StreamSession::new(fast_config(), Arc::new(ListingJobs), Arc::new(NoopObserver));
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, ()) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                while job_hits.load(Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        // Setup refresh, then one refresh before the sync was retried
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(job_hits.load(Ordering::SeqCst), 2);
        // Rejected again after the capped retry: nothing left to reuse
        assert!(credentials.access_token().is_none());
    }

    #[tokio::test]
    async fn peer_ping_answered_while_reauthenticating() {
        let (mut backend, mut replies) = Backend::scripted(&[]);
        backend.slow_refresh = Some(Duration::from_secs(3));
        backend.late_frame = Some((Duration::from_millis(200), r#"{"cmd":1,"echo":"mid-auth"}"#.into()));
        let refreshes = backend.refreshes.clone();
        let completed = backend.completed_refreshes.clone();
        let endpoint = serve(backend.router()).await;
        let mut credentials = credentials(&endpoint);
        credentials.refresh().await.unwrap();
        let mut pool = EndpointPool::new(vec![endpoint]).unwrap();
        let config = SessionConfig {
            user_info_poll: Some(Duration::from_secs(3600)),
            ..fast_config()
        };
        let mut session = plain_session(config);
        let cancel = CancellationToken::new();

        let ctx = SessionContext {
            credentials: &mut credentials,
            pool: &mut pool,
            device_id: "dev-1",
        };
        let (result, (reply, started, finished)) = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::join!(session.run(ctx, &cancel), async {
                let reply = replies.recv().await.unwrap();
                let started = refreshes.load(Ordering::SeqCst);
                let finished = completed.load(Ordering::SeqCst);
                cancel.cancel();
                (reply, started, finished)
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(reply_json(&reply), json!({"cmd": 2, "echo": "mid-auth"}));
        // The re-auth refresh had started but not finished
        assert_eq!(started, 2);
        assert_eq!(finished, 1);
    }
}
