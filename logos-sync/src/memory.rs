//! In-process loopback transport.
//!
//! Stands in for the WebSocket transport in tests and offline demos: each
//! `open` consumes the next scripted [`OpenOutcome`] and, when accepted,
//! exposes the far end of the link as a [`MemoryPeer`] the caller drives.

use futures_util::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::protocol::{Channel, ClientFrame, ServerFrame};
use crate::transport::{ChannelLink, Transport};

/// What the next `open` call does.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Accept,
    /// Accept after a delay
    Delay(Duration),
    Fail(ConnectError),
    /// Never resolve; exercises the connect timeout
    Hang,
}

/// Far end of an accepted link.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames the client sent on this sub-channel
    pub received: mpsc::Receiver<ClientFrame>,
    /// Frames to deliver to the client; drop to simulate a lost sub-channel
    pub sender: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct MemoryInner {
    script: VecDeque<OpenOutcome>,
    fallback: Option<OpenOutcome>,
    opens: HashMap<Channel, u32>,
    credentials: Vec<Option<String>>,
    resets: u32,
    peers: HashMap<Channel, MemoryPeer>,
}

/// Scriptable [`Transport`] that never touches the network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    /// Transport that accepts every open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next `open` calls, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.script.extend(outcomes);
        }
    }

    /// Outcome used once the script runs out (default: accept).
    pub fn set_fallback(&self, outcome: OpenOutcome) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fallback = Some(outcome);
        }
    }

    /// Number of `open` calls seen for `channel`.
    pub fn opens(&self, channel: Channel) -> u32 {
        self.inner
            .lock()
            .map(|i| i.opens.get(&channel).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Credentials presented by every `open`, in call order.
    pub fn credentials(&self) -> Vec<Option<String>> {
        self.inner
            .lock()
            .map(|i| i.credentials.clone())
            .unwrap_or_default()
    }

    /// Number of `reset` calls.
    pub fn resets(&self) -> u32 {
        self.inner.lock().map(|i| i.resets).unwrap_or(0)
    }

    /// Take the far end of the latest accepted link for `channel`.
    pub fn take_peer(&self, channel: Channel) -> Option<MemoryPeer> {
        self.inner.lock().ok()?.peers.remove(&channel)
    }

    fn accept(inner: &Arc<Mutex<MemoryInner>>, channel: Channel) -> Result<ChannelLink, ConnectError> {
        let (client_tx, client_rx) = mpsc::channel(256);
        let (server_tx, server_rx) = mpsc::channel(256);
        let mut inner = inner
            .lock()
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        inner.peers.insert(
            channel,
            MemoryPeer {
                received: client_rx,
                sender: server_tx,
            },
        );
        Ok(ChannelLink {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        channel: Channel,
        credential: Option<String>,
    ) -> BoxFuture<'static, Result<ChannelLink, ConnectError>> {
        let outcome = match self.inner.lock() {
            Ok(mut inner) => {
                *inner.opens.entry(channel).or_insert(0) += 1;
                inner.credentials.push(credential);
                let fallback = inner.fallback.clone().unwrap_or(OpenOutcome::Accept);
                inner.script.pop_front().unwrap_or(fallback)
            }
            Err(e) => OpenOutcome::Fail(ConnectError::Network(e.to_string())),
        };
        let inner = self.inner.clone();
        Box::pin(async move {
            match outcome {
                OpenOutcome::Accept => Self::accept(&inner, channel),
                OpenOutcome::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Self::accept(&inner, channel)
                }
                OpenOutcome::Fail(err) => Err(err),
                OpenOutcome::Hang => std::future::pending().await,
            }
        })
    }

    fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.resets += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_then_fallback() {
        let transport = MemoryTransport::new();
        transport.script([OpenOutcome::Fail(ConnectError::Network("down".into()))]);

        assert!(transport.open(Channel::Chat, None).await.is_err());
        assert!(transport.open(Channel::Chat, Some("t".into())).await.is_ok());
        assert_eq!(transport.opens(Channel::Chat), 2);
        assert_eq!(transport.credentials(), vec![None, Some("t".to_string())]);
    }

    #[tokio::test]
    async fn test_peer_sees_client_frames() {
        let transport = MemoryTransport::new();
        let mut link = transport.open(Channel::Presence, None).await.unwrap();
        let mut peer = transport.take_peer(Channel::Presence).unwrap();

        link.outbound.send(ClientFrame::Ping { timestamp: 3 }).await.unwrap();
        assert_eq!(peer.received.recv().await, Some(ClientFrame::Ping { timestamp: 3 }));

        peer.sender.send(ServerFrame::Pong { timestamp: 3 }).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(ServerFrame::Pong { timestamp: 3 }));

        drop(peer);
        assert_eq!(link.inbound.recv().await, None);
    }
}
