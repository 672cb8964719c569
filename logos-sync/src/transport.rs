//! Transport channel: one physical WebSocket multiplexed into logical
//! sub-channels.
//!
//! ```text
//!  ChannelLink(chat) ──────┐                      ┌── reader task ──► route by Envelope.channel
//!  ChannelLink(collab) ────┼── writer task ── WebSocket
//!  ChannelLink(presence) ──┘                      └── close/error ──► drop every route
//! ```
//!
//! Each sub-channel opens with `ClientFrame::Open` carrying the shared
//! credential and is live once the peer answers `ServerFrame::Opened`.
//! Dropping a link's outbound sender closes that sub-channel; when the last
//! sub-channel closes the physical socket is released. [`Transport::reset`]
//! condemns the socket outright: every sub-channel on it is lost and the next
//! `open` dials a fresh one.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::TransportConfig;
use crate::error::ConnectError;
use crate::protocol::{Channel, ClientFrame, Envelope, ServerFrame};

/// An open logical sub-channel.
///
/// `inbound` ending means the sub-channel was lost.
#[derive(Debug)]
pub struct ChannelLink {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Opens logical sub-channels. Implementations own the physical connection.
pub trait Transport: Send + Sync + 'static {
    /// Open `channel`, authenticating with `credential`.
    ///
    /// Resolves once the peer accepted the sub-channel. Timeouts are applied
    /// by the caller.
    fn open(
        &self,
        channel: Channel,
        credential: Option<String>,
    ) -> BoxFuture<'static, Result<ChannelLink, ConnectError>>;

    /// The physical connection stopped answering. Drop it so the next `open`
    /// starts over.
    fn reset(&self) {}
}

type Route = (u64, mpsc::Sender<ServerFrame>);

struct Physical {
    writer: mpsc::Sender<Envelope<ClientFrame>>,
    routes: Arc<Mutex<HashMap<Channel, Route>>>,
    reader: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Physical {
    fn is_alive(&self) -> bool {
        !self.writer.is_closed() && !self.reader.is_finished()
    }

    /// Stop both socket tasks and end every route's inbound stream.
    async fn shut_down(self) {
        self.reader.abort();
        self.writer_task.abort();
        self.routes.lock().await.clear();
    }
}

struct WsInner {
    config: TransportConfig,
    physical: Mutex<Option<Physical>>,
    next_route: AtomicU64,
    /// Set by `reset`; the current socket must not be reused
    condemned: AtomicBool,
}

/// WebSocket implementation of [`Transport`].
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(WsInner {
                config,
                physical: Mutex::new(None),
                next_route: AtomicU64::new(1),
                condemned: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

impl Transport for WsTransport {
    fn open(
        &self,
        channel: Channel,
        credential: Option<String>,
    ) -> BoxFuture<'static, Result<ChannelLink, ConnectError>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.open(channel, credential).await })
    }

    fn reset(&self) {
        self.inner.condemned.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut physical = inner.physical.lock().await;
            inner.drop_condemned(&mut physical).await;
        });
    }
}

impl WsInner {
    async fn open(
        self: Arc<Self>,
        channel: Channel,
        credential: Option<String>,
    ) -> Result<ChannelLink, ConnectError> {
        let route_id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (in_tx, mut in_rx) = mpsc::channel(self.config.inbound_capacity);

        let writer = {
            let mut physical = self.physical.lock().await;
            self.drop_condemned(&mut physical).await;
            let alive = physical.as_ref().is_some_and(Physical::is_alive);
            if !alive {
                *physical = Some(self.dial().await?);
            }
            let Some(phys) = physical.as_ref() else {
                return Err(ConnectError::Network("socket unavailable".into()));
            };
            phys.routes.lock().await.insert(channel, (route_id, in_tx));
            phys.writer.clone()
        };

        writer
            .send(Envelope::new(channel, ClientFrame::Open { credential }))
            .await
            .map_err(|_| ConnectError::Network("socket closed during open".into()))?;

        match in_rx.recv().await {
            Some(ServerFrame::Opened) => {}
            Some(ServerFrame::Error { category, code }) => {
                self.release(channel, route_id).await;
                return Err(ConnectError::from_error_frame(category, code));
            }
            Some(other) => {
                log::warn!("Unexpected {other:?} while opening {channel}");
                self.release(channel, route_id).await;
                return Err(ConnectError::Network(format!("{channel} open not acknowledged")));
            }
            None => return Err(ConnectError::Network(format!("{channel} closed during open"))),
        }

        log::debug!("Sub-channel {channel} open");
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(self.config.outbound_capacity);
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.send(Envelope::new(channel, frame)).await.is_err() {
                    break;
                }
            }
            let _ = writer.send(Envelope::new(channel, ClientFrame::Close)).await;
            inner.release(channel, route_id).await;
        });

        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    /// Connect the physical socket and spawn its reader/writer tasks.
    async fn dial(&self) -> Result<Physical, ConnectError> {
        log::info!("Connecting to {}", self.config.url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (writer, mut out_rx) = mpsc::channel::<Envelope<ClientFrame>>(256);
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let bytes = match envelope.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let routes: Arc<Mutex<HashMap<Channel, Route>>> = Arc::new(Mutex::new(HashMap::new()));
        let reader_routes = routes.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let envelope = match Envelope::<ServerFrame>::decode(&bytes) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                log::warn!("Dropping malformed frame: {e}");
                                continue;
                            }
                        };
                        let route = reader_routes
                            .lock()
                            .await
                            .get(&envelope.channel)
                            .map(|(_, tx)| tx.clone());
                        match route {
                            Some(tx) => {
                                let _ = tx.send(envelope.frame).await;
                            }
                            None => log::trace!("No route for {} frame", envelope.channel),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Socket closed");
            // Dropping the senders ends every link's inbound stream.
            reader_routes.lock().await.clear();
        });

        Ok(Physical {
            writer,
            routes,
            reader,
            writer_task,
        })
    }

    /// Tear down the socket if `reset` condemned it.
    async fn drop_condemned(&self, physical: &mut Option<Physical>) {
        if !self.condemned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(phys) = physical.take() {
            log::info!("Dropping unresponsive socket to {}", self.config.url);
            phys.shut_down().await;
        }
    }

    /// Remove a route; release the socket when it was the last one.
    async fn release(&self, channel: Channel, route_id: u64) {
        let mut physical = self.physical.lock().await;
        let Some(phys) = physical.as_ref() else {
            return;
        };
        let now_empty = {
            let mut routes = phys.routes.lock().await;
            // a route from an earlier socket leaves this one alone
            if !routes.get(&channel).is_some_and(|(id, _)| *id == route_id) {
                return;
            }
            routes.remove(&channel);
            routes.is_empty()
        };
        if now_empty {
            if let Some(phys) = physical.take() {
                log::debug!("Last sub-channel closed, releasing socket");
                // the writer drains the queued Close frames, then closes the socket
                phys.reader.abort();
            }
        }
    }
}
