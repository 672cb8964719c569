//! Presentation-level connection state machine.
//!
//! [`ConnectionStateMachine`] is a pure transition function over manager
//! status reports, OS network reachability and user retries. The
//! [`Supervisor`] task feeds it and performs the `connect()` calls it asks for.
//! The latest manager status is tracked even while offline, and every
//! `connect()` outcome re-projects it, so the machine never waits on a status
//! change that will not come.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::ConnectError;

/// What the application shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Offline,
}

impl From<ConnectionStatus> for ConnectionState {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Disconnected => ConnectionState::Disconnected,
            ConnectionStatus::Connecting => ConnectionState::Connecting,
            ConnectionStatus::Connected => ConnectionState::Connected,
            ConnectionStatus::Reconnecting => ConnectionState::Reconnecting,
            ConnectionStatus::Failed => ConnectionState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Status(ConnectionStatus),
    NetworkOnline,
    NetworkOffline,
    /// User asked to retry
    Retry,
    /// A requested `connect()` returned; carries the manager status at that point
    ConnectFinished(ConnectionStatus),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Connect { force: bool },
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    offline: bool,
    /// Last manager status, recorded even while offline
    manager: Option<ConnectionStatus>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Initializing,
            offline: false,
            manager: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Most recent manager status seen, including while offline.
    pub fn manager_status(&self) -> Option<ConnectionStatus> {
        self.manager
    }

    pub fn handle(&mut self, input: Input) -> Option<Effect> {
        match input {
            Input::NetworkOffline => {
                self.offline = true;
                self.state = ConnectionState::Offline;
                None
            }
            Input::NetworkOnline if self.offline => {
                self.offline = false;
                self.state = ConnectionState::Connecting;
                Some(Effect::Connect { force: false })
            }
            Input::NetworkOnline => None,
            Input::Status(status) | Input::ConnectFinished(status) => {
                self.manager = Some(status);
                // status reports never leave Offline
                if !self.offline {
                    self.state = status.into();
                }
                None
            }
            Input::Retry if self.offline => None,
            Input::Retry => {
                self.state = ConnectionState::Connecting;
                Some(Effect::Connect { force: true })
            }
        }
    }
}

/// Handle to a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    state: watch::Receiver<ConnectionState>,
    retry_tx: mpsc::Sender<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// User-initiated retry; forces past an open circuit or auth failure.
    pub async fn retry(&self) {
        let _ = self.retry_tx.send(()).await;
    }
}

/// Drives a [`ConnectionStateMachine`] from live inputs.
pub struct Supervisor {
    manager: ConnectionManager,
    machine: ConnectionStateMachine,
    status: watch::Receiver<ConnectionStatus>,
    network: watch::Receiver<bool>,
    retry_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<ConnectionState>,
    /// Signalled when a spawned `connect()` returns
    done_tx: mpsc::Sender<()>,
}

impl Supervisor {
    /// Spawn the driver. `network` carries OS reachability (`true` = online).
    pub fn spawn(
        manager: ConnectionManager,
        network: watch::Receiver<bool>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (state_tx, state) = watch::channel(ConnectionState::Initializing);
        let (retry_tx, retry_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = mpsc::channel(8);
        let supervisor = Self {
            status: manager.subscribe(),
            manager,
            machine: ConnectionStateMachine::new(),
            network,
            retry_rx,
            state_tx,
            done_tx,
        };
        let task = tokio::spawn(supervisor.run(done_rx));
        (SupervisorHandle { state, retry_tx }, task)
    }

    async fn run(mut self, mut done_rx: mpsc::Receiver<()>) {
        let status = *self.status.borrow_and_update();
        self.apply(Input::Status(status));
        if !*self.network.borrow_and_update() {
            self.apply(Input::NetworkOffline);
        }

        loop {
            let input = tokio::select! {
                changed = self.status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    Input::Status(*self.status.borrow_and_update())
                }
                changed = self.network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *self.network.borrow_and_update() {
                        Input::NetworkOnline
                    } else {
                        Input::NetworkOffline
                    }
                }
                retry = self.retry_rx.recv() => match retry {
                    Some(()) => Input::Retry,
                    None => break,
                },
                Some(()) = done_rx.recv() => {
                    Input::ConnectFinished(*self.status.borrow_and_update())
                }
            };
            self.apply(input);
        }
    }

    fn apply(&mut self, input: Input) {
        let effect = self.machine.handle(input);
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Connection state {current:?} -> {state:?} on {input:?}");
            *current = state;
            true
        });

        if let Some(Effect::Connect { force }) = effect {
            let manager = self.manager.clone();
            let done = self.done_tx.clone();
            tokio::spawn(async move {
                match manager.connect(force).await {
                    Ok(()) | Err(ConnectError::Cancelled) => {}
                    Err(e) => log::warn!("Connect failed: {e}"),
                }
                let _ = done.send(()).await;
            });
        }
    }
}
