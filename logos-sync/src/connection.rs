//! Connection manager: lifecycle, reconnection, circuit breaking and health
//! checks for the three logical sub-channels.
//!
//! ```text
//!  ConnectionManager (handle, Clone)
//!        │ Command (mpsc)                 watch: status, session, link slots
//!        ▼                                broadcast: inbound frames per channel
//!  ┌──────────────────────── actor task ────────────────────────┐
//!  │ attempt: JoinHandle ── Transport::open × missing channels  │
//!  │ links[3] ── pump tasks ──► LinkEvent (mpsc)                │
//!  │ timers: reconnect │ health │ ping timeout │ credential      │
//!  │ refresh: JoinHandle ── CredentialSource::refresh           │
//!  └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All session state lives in the actor task; timers are owned fields, so
//! replacing or clearing one cancels it. Link events carry the id of the
//! link they came from and are ignored once that link has been replaced.

use futures_util::future::join_all;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Sleep};

use crate::backoff::{Backoff, CircuitBreaker, CircuitState};
use crate::channel::{ChannelHandle, LinkSlot};
use crate::config::{ConnectionConfig, TransportConfig};
use crate::credential::{self, CredentialSource};
use crate::error::{AuthError, ConnectError};
use crate::protocol::{Channel, ClientFrame, ServerFrame};
use crate::transport::{ChannelLink, Transport, WsTransport};

/// Aggregate status over all sub-channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Connection quality and history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Round trip of the last answered health ping
    pub latency_ms: Option<u64>,
    /// Retries scheduled since the manager started
    pub reconnect_count: u64,
    /// Failed connection attempts since the manager started
    pub failure_count: u64,
    pub last_successful_connect_at: Option<SystemTime>,
}

/// Point-in-time view of the session, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub circuit: CircuitState,
    pub backoff_attempt: u32,
    pub forced_disconnect: bool,
    /// Open sub-channels, indexed like [`Channel::ALL`]
    pub connected: [bool; 3],
    /// Delay of the retry currently scheduled
    pub next_retry_delay: Option<Duration>,
    pub auth_failure: Option<AuthError>,
    pub metrics: ConnectionMetrics,
}

impl SessionSnapshot {
    pub fn is_connected(&self, channel: Channel) -> bool {
        self.connected[channel.index()]
    }
}

enum Command {
    Connect {
        force: bool,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

struct Shared {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    session_rx: watch::Receiver<SessionSnapshot>,
    links: [watch::Receiver<LinkSlot>; 3],
    frames: [broadcast::Sender<ServerFrame>; 3],
}

/// Handle to the process-wide connection session.
///
/// Cheap to clone. The session ends when the last handle is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Spawn the session actor. Must be called inside a tokio runtime.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (link_events_tx, link_events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let link_txs: [watch::Sender<LinkSlot>; 3] =
            std::array::from_fn(|_| watch::Sender::new(None));
        let links = std::array::from_fn(|i| link_txs[i].subscribe());
        let frames: [broadcast::Sender<ServerFrame>; 3] =
            std::array::from_fn(|_| broadcast::channel(config.channel_capacity.max(1)).0);

        let breaker = CircuitBreaker::new(config.circuit_reset_timeout());
        let mut actor = Actor {
            backoff: Backoff::from_config(&config),
            credential_timer: Some(Box::pin(tokio::time::sleep(config.credential_check_interval()))),
            config,
            transport,
            credentials,
            cmd_rx,
            link_events_tx,
            link_events_rx,
            links: [None, None, None],
            next_link_id: 1,
            attempt: None,
            waiters: Vec::new(),
            breaker,
            backoff_attempt: 0,
            forced_disconnect: false,
            auth_failure: None,
            retry_after_refresh: false,
            refreshed_for_retry: false,
            metrics: ConnectionMetrics::default(),
            next_retry_delay: None,
            reconnect_timer: None,
            health_timer: None,
            ping_timer: None,
            refresh_task: None,
            outstanding_ping: None,
            last_pong: Instant::now(),
            epoch: Instant::now(),
            status_tx,
            session_tx: watch::Sender::new(Self::initial_snapshot()),
            link_txs,
            frames_tx: frames.clone(),
        };
        let session_rx = actor.session_tx.subscribe();
        actor.publish();
        tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                cmd_tx,
                status_rx,
                session_rx,
                links,
                frames,
            }),
        }
    }

    /// Session over the WebSocket transport.
    pub fn with_websocket(
        config: ConnectionConfig,
        transport: TransportConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self::new(config, Arc::new(WsTransport::new(transport)), credentials)
    }

    fn initial_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            status: ConnectionStatus::Disconnected,
            circuit: CircuitState::Closed,
            backoff_attempt: 0,
            forced_disconnect: false,
            connected: [false; 3],
            next_retry_delay: None,
            auth_failure: None,
            metrics: ConnectionMetrics::default(),
        }
    }

    /// Open every sub-channel.
    ///
    /// Joins an attempt already in flight. Fails fast with
    /// [`ConnectError::CircuitOpen`] while the breaker is open, unless
    /// `force` is set. `force` also clears a terminal auth failure.
    pub async fn connect(&self, force: bool) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .cmd_tx
            .send(Command::Connect { force, reply })
            .await
            .map_err(|_| ConnectError::Shutdown)?;
        rx.await.map_err(|_| ConnectError::Shutdown)?
    }

    /// Tear everything down and suppress auto-reconnection until the next
    /// `connect()`. Idempotent.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Stop the session task. Other handles observe `Shutdown` errors.
    pub async fn shutdown(&self) {
        let _ = self.shared.cmd_tx.send(Command::Shutdown).await;
    }

    /// Status changes; the current status is readable immediately.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_rx.clone()
    }

    /// Full session changes.
    pub fn subscribe_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.session_rx.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_rx.borrow()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.shared.session_rx.borrow().clone()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.session_rx.borrow().metrics.clone()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.session_rx.borrow().circuit
    }

    /// Bind to one sub-channel for sending and receiving its frames.
    pub fn join_logical_channel(&self, channel: Channel) -> ChannelHandle {
        let i = channel.index();
        ChannelHandle::new(
            channel,
            self.shared.links[i].clone(),
            self.shared.frames[i].clone(),
        )
    }
}

/// Frame or loss notification from one link's pump task.
struct LinkEvent {
    channel: Channel,
    link_id: u64,
    /// `None` when the link closed
    frame: Option<ServerFrame>,
}

struct LiveLink {
    id: u64,
    outbound: mpsc::Sender<ClientFrame>,
    pump: JoinHandle<()>,
}

type Timer = Option<Pin<Box<Sleep>>>;
type AttemptResults = Vec<(Channel, Result<ChannelLink, ConnectError>)>;

struct Actor {
    config: ConnectionConfig,
    backoff: Backoff,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,

    cmd_rx: mpsc::Receiver<Command>,
    link_events_tx: mpsc::Sender<LinkEvent>,
    link_events_rx: mpsc::Receiver<LinkEvent>,
    links: [Option<LiveLink>; 3],
    next_link_id: u64,

    attempt: Option<JoinHandle<AttemptResults>>,
    waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,

    breaker: CircuitBreaker,
    backoff_attempt: u32,
    forced_disconnect: bool,
    auth_failure: Option<AuthError>,
    /// Reconnect once the running refresh succeeds
    retry_after_refresh: bool,
    /// The attempt in flight was started by a refresh; another auth failure is terminal
    refreshed_for_retry: bool,
    metrics: ConnectionMetrics,
    next_retry_delay: Option<Duration>,

    reconnect_timer: Timer,
    health_timer: Timer,
    ping_timer: Timer,
    credential_timer: Timer,
    refresh_task: Option<JoinHandle<Result<String, AuthError>>>,

    outstanding_ping: Option<u64>,
    last_pong: Instant,
    epoch: Instant,

    status_tx: watch::Sender<ConnectionStatus>,
    session_tx: watch::Sender<SessionSnapshot>,
    link_txs: [watch::Sender<LinkSlot>; 3],
    frames_tx: [broadcast::Sender<ServerFrame>; 3],
}

/// Resolves when the timer fires; never when unset.
async fn fire(timer: &mut Timer) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Resolves when the task finishes; never when unset.
async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn timer(after: Duration) -> Timer {
    Some(Box::pin(tokio::time::sleep(after)))
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect { force, reply }) => self.on_connect(force, reply),
                    Some(Command::Disconnect { reply }) => {
                        self.on_disconnect();
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.link_events_rx.recv() => self.on_link_event(event),
                results = join(&mut self.attempt) => self.on_attempt_finished(results),
                result = join(&mut self.refresh_task) => self.on_refresh_finished(result),
                _ = fire(&mut self.reconnect_timer) => self.on_reconnect_timer(),
                _ = fire(&mut self.health_timer) => self.on_health_tick(),
                _ = fire(&mut self.ping_timer) => self.on_ping_timeout(),
                _ = fire(&mut self.credential_timer) => self.on_credential_tick(),
            }
        }
        log::info!("Connection manager shutting down");
        self.on_disconnect();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Shutdown));
        }
    }

    // ─── Commands ────────────────────────────────────────────────

    fn on_connect(&mut self, force: bool, reply: oneshot::Sender<Result<(), ConnectError>>) {
        self.forced_disconnect = false;
        if self.credential_timer.is_none() {
            self.credential_timer = timer(self.config.credential_check_interval());
        }
        if force {
            self.auth_failure = None;
        } else if let Some(err) = &self.auth_failure {
            let _ = reply.send(Err(err.clone().into()));
            return;
        }

        if let Err(retry_in) = self.breaker.admit(Instant::now(), force) {
            log::debug!("Connect rejected, circuit open for another {retry_in:?}");
            let _ = reply.send(Err(ConnectError::CircuitOpen { retry_in }));
            return;
        }

        if self.all_connected() {
            self.breaker.record_success();
            let _ = reply.send(Ok(()));
            self.publish();
            return;
        }

        self.waiters.push(reply);
        if self.attempt.is_some() {
            if !force {
                return;
            }
            if let Some(attempt) = self.attempt.take() {
                attempt.abort();
            }
        }
        self.reconnect_timer = None;
        self.next_retry_delay = None;
        self.start_attempt();
        self.publish();
    }

    fn on_disconnect(&mut self) {
        log::info!("Disconnecting all sub-channels");
        self.forced_disconnect = true;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }
        for channel in Channel::ALL {
            self.drop_link(channel);
        }
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.reconnect_timer = None;
        self.health_timer = None;
        self.ping_timer = None;
        self.credential_timer = None;
        self.outstanding_ping = None;
        self.next_retry_delay = None;
        self.retry_after_refresh = false;
        self.refreshed_for_retry = false;
        self.breaker.reset();
        self.backoff_attempt = 0;
        self.publish();
    }

    // ─── Connection attempts ─────────────────────────────────────

    fn start_attempt(&mut self) {
        let missing: Vec<Channel> = Channel::ALL
            .into_iter()
            .filter(|ch| self.links[ch.index()].is_none())
            .collect();
        log::info!("Opening sub-channels {missing:?}");

        let transport = self.transport.clone();
        let credential = self.credentials.current();
        let timeout = self.config.connect_timeout();
        self.attempt = Some(tokio::spawn(async move {
            let opens = missing.into_iter().map(|channel| {
                let open = transport.open(channel, credential.clone());
                async move {
                    let result = match tokio::time::timeout(timeout, open).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectError::Timeout(timeout)),
                    };
                    (channel, result)
                }
            });
            join_all(opens).await
        }));
    }

    fn on_attempt_finished(&mut self, results: Result<AttemptResults, JoinError>) {
        self.attempt = None;
        let results = results.unwrap_or_else(|e| {
            Channel::ALL
                .into_iter()
                .map(|ch| (ch, Err(ConnectError::Network(format!("attempt aborted: {e}")))))
                .collect()
        });

        let mut failure: Option<ConnectError> = None;
        let mut any_opened = false;
        for (channel, result) in results {
            match result {
                Ok(link) => {
                    self.install_link(channel, link);
                    any_opened = true;
                }
                Err(err) => {
                    log::warn!("Failed to open {channel}: {err}");
                    // auth failures take precedence over network ones
                    let replace = match &failure {
                        None => true,
                        Some(prev) => !matches!(prev, ConnectError::Auth(_))
                            && matches!(err, ConnectError::Auth(_)),
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
            }
        }
        if any_opened {
            self.backoff_attempt = 0;
        }
        if failure.is_none() && !self.all_connected() {
            // a link opened earlier dropped while this attempt ran
            failure = Some(ConnectError::Network("sub-channel lost during connect".into()));
        }

        let outcome = match failure {
            None => {
                log::info!("All sub-channels connected");
                self.breaker.record_success();
                self.auth_failure = None;
                self.refreshed_for_retry = false;
                self.metrics.last_successful_connect_at = Some(SystemTime::now());
                self.health_timer = timer(self.config.health_check_interval());
                self.ping_timer = None;
                self.outstanding_ping = None;
                self.last_pong = Instant::now();
                Ok(())
            }
            Some(err) => {
                self.metrics.failure_count += 1;
                self.on_attempt_failed(&err);
                Err(err)
            }
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.publish();
    }

    fn on_attempt_failed(&mut self, err: &ConnectError) {
        match err {
            ConnectError::Auth(auth) => {
                if self.refreshed_for_retry {
                    log::error!("Credential rejected after refresh: {auth}");
                    self.fail_auth(auth.clone());
                } else {
                    self.begin_refresh(true);
                }
            }
            err if err.is_retryable() => {
                if self.breaker.state() == CircuitState::HalfOpen {
                    self.breaker.trip(Instant::now());
                    self.next_retry_delay = None;
                } else {
                    self.schedule_retry();
                }
            }
            _ => {}
        }
    }

    /// Schedule the next retry, or open the breaker when attempts are spent.
    fn schedule_retry(&mut self) {
        if self.forced_disconnect || self.attempt.is_some() || self.reconnect_timer.is_some() {
            return;
        }
        if self.backoff_attempt >= self.config.max_attempts {
            // a stray link loss must not push the reset deadline out
            if !self.breaker.is_open() {
                log::warn!(
                    "Giving up after {} reconnection attempts",
                    self.backoff_attempt
                );
                self.breaker.trip(Instant::now());
            }
            self.next_retry_delay = None;
            return;
        }
        let delay = self.backoff.delay(self.backoff_attempt);
        self.backoff_attempt += 1;
        self.metrics.reconnect_count += 1;
        self.next_retry_delay = Some(delay);
        log::info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            self.backoff_attempt
        );
        self.reconnect_timer = timer(delay);
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_timer = None;
        self.next_retry_delay = None;
        if self.forced_disconnect || self.attempt.is_some() || self.breaker.is_open() {
            self.publish();
            return;
        }
        self.start_attempt();
        self.publish();
    }

    // ─── Links ───────────────────────────────────────────────────

    fn install_link(&mut self, channel: Channel, link: ChannelLink) {
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        let ChannelLink {
            outbound,
            mut inbound,
        } = link;

        let events = self.link_events_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let event = LinkEvent {
                    channel,
                    link_id,
                    frame: Some(frame),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events
                .send(LinkEvent {
                    channel,
                    link_id,
                    frame: None,
                })
                .await;
        });

        let i = channel.index();
        let previous = self.links[i].replace(LiveLink {
            id: link_id,
            outbound: outbound.clone(),
            pump,
        });
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        self.link_txs[i].send_replace(Some(outbound));
        log::debug!("Sub-channel {channel} live (link {link_id})");
    }

    /// Close our side of a link. The transport sees the outbound end drop.
    fn drop_link(&mut self, channel: Channel) {
        let i = channel.index();
        if let Some(link) = self.links[i].take() {
            link.pump.abort();
            self.link_txs[i].send_replace(None);
        }
        if channel == Channel::PRIMARY {
            self.outstanding_ping = None;
            self.ping_timer = None;
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let i = event.channel.index();
        if self.links[i].as_ref().map(|l| l.id) != Some(event.link_id) {
            log::trace!("Ignoring event from stale {} link", event.channel);
            return;
        }
        match event.frame {
            None => {
                log::warn!("Sub-channel {} lost", event.channel);
                self.drop_link(event.channel);
                self.schedule_retry();
                self.publish();
            }
            Some(ServerFrame::Pong { timestamp }) if event.channel == Channel::PRIMARY => {
                self.on_pong(timestamp);
            }
            Some(frame) => {
                if frame.is_auth_error() {
                    log::warn!("Peer rejected credential on {}", event.channel);
                    self.begin_refresh(true);
                }
                // no subscribers is fine
                let _ = self.frames_tx[i].send(frame);
            }
        }
    }

    fn all_connected(&self) -> bool {
        self.links.iter().all(Option::is_some)
    }

    // ─── Health monitoring ───────────────────────────────────────

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn on_health_tick(&mut self) {
        self.health_timer = timer(self.config.health_check_interval());
        if self.outstanding_ping.is_some()
            && self.last_pong.elapsed() >= self.config.ping_timeout() * 2
        {
            self.on_silent_failure();
            return;
        }
        let Some(link) = &self.links[Channel::PRIMARY.index()] else {
            return;
        };
        let timestamp = self.now_ms();
        match link.outbound.try_send(ClientFrame::Ping { timestamp }) {
            Ok(()) => {
                log::trace!("Health ping {timestamp}");
                if self.outstanding_ping.is_none() {
                    self.ping_timer = timer(self.config.ping_timeout());
                }
                self.outstanding_ping = Some(timestamp);
            }
            Err(e) => log::debug!("Health ping not sent: {e}"),
        }
    }

    fn on_pong(&mut self, timestamp: u64) {
        self.last_pong = Instant::now();
        if self.outstanding_ping.take().is_some() {
            self.ping_timer = None;
        }
        let latency = self.now_ms().saturating_sub(timestamp);
        log::trace!("Health pong, latency {latency}ms");
        self.metrics.latency_ms = Some(latency);
        self.publish();
    }

    fn on_ping_timeout(&mut self) {
        self.ping_timer = None;
        log::warn!(
            "No pong within {}ms, treating connection as dead",
            self.config.ping_timeout_ms
        );
        self.on_silent_failure();
    }

    fn on_silent_failure(&mut self) {
        // the socket may be half-open; reopening must not reuse it
        self.transport.reset();
        self.drop_link(Channel::PRIMARY);
        self.schedule_retry();
        self.publish();
    }

    // ─── Credentials ─────────────────────────────────────────────

    fn on_credential_tick(&mut self) {
        self.credential_timer = timer(self.config.credential_check_interval());
        let Some(token) = self.credentials.current() else {
            return;
        };
        if credential::needs_refresh(&token, self.config.credential_refresh_threshold()) {
            log::info!("Credential close to expiry, refreshing");
            self.begin_refresh(false);
        }
    }

    fn begin_refresh(&mut self, retry: bool) {
        self.retry_after_refresh |= retry;
        if self.refresh_task.is_some() {
            return;
        }
        self.refresh_task = Some(tokio::spawn(self.credentials.refresh()));
    }

    fn on_refresh_finished(&mut self, result: Result<Result<String, AuthError>, JoinError>) {
        self.refresh_task = None;
        let retry = std::mem::take(&mut self.retry_after_refresh);
        let result = result.unwrap_or_else(|e| Err(AuthError::RefreshFailed(e.to_string())));
        match result {
            Ok(token) => {
                log::info!("Credential refreshed");
                for link in self.links.iter().flatten() {
                    let frame = ClientFrame::Credential {
                        token: token.clone(),
                    };
                    if let Err(e) = link.outbound.try_send(frame) {
                        log::warn!("Could not push refreshed credential: {e}");
                    }
                }
                if retry
                    && !self.forced_disconnect
                    && self.attempt.is_none()
                    && !self.all_connected()
                {
                    self.reconnect_timer = None;
                    self.next_retry_delay = None;
                    self.refreshed_for_retry = true;
                    self.start_attempt();
                }
            }
            Err(err) => {
                let expired = self
                    .credentials
                    .current()
                    .and_then(|t| credential::time_to_expiry(&t))
                    .is_some_and(|left| left.is_zero());
                if retry || expired {
                    log::error!("Credential refresh failed: {err}");
                    self.fail_auth(if expired { AuthError::Expired } else { err });
                } else {
                    log::warn!("Proactive credential refresh failed: {err}");
                }
            }
        }
        self.publish();
    }

    /// Terminal auth failure: status `Failed` until `connect(force = true)`.
    fn fail_auth(&mut self, err: AuthError) {
        self.auth_failure = Some(err);
        self.reconnect_timer = None;
        self.next_retry_delay = None;
        self.refreshed_for_retry = false;
    }

    // ─── Status ──────────────────────────────────────────────────

    fn status(&self) -> ConnectionStatus {
        if self.breaker.is_open() || self.auth_failure.is_some() {
            return ConnectionStatus::Failed;
        }
        let open = self.links.iter().filter(|l| l.is_some()).count();
        if open == Channel::ALL.len() {
            ConnectionStatus::Connected
        } else if open > 0 {
            ConnectionStatus::Reconnecting
        } else if self.attempt.is_some() {
            ConnectionStatus::Connecting
        } else if self.reconnect_timer.is_some()
            || (self.refresh_task.is_some() && self.retry_after_refresh)
        {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn publish(&mut self) {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            self.health_timer = None;
            self.ping_timer = None;
            self.outstanding_ping = None;
        } else if self.health_timer.is_none() {
            self.health_timer = timer(self.config.health_check_interval());
        }

        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            log::info!("Connection status {current:?} -> {status:?}");
            *current = status;
            true
        });

        let snapshot = SessionSnapshot {
            status,
            circuit: self.breaker.state(),
            backoff_attempt: self.backoff_attempt,
            forced_disconnect: self.forced_disconnect,
            connected: std::array::from_fn(|i| self.links[i].is_some()),
            next_retry_delay: self.next_retry_delay,
            auth_failure: self.auth_failure.clone(),
            metrics: self.metrics.clone(),
        };
        self.session_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
