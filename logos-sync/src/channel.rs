//! Handle bound to one logical sub-channel.

use tokio::sync::{broadcast, mpsc, watch};

use crate::protocol::{Channel, ClientFrame, ServerFrame};

/// Outbound sender of the currently open link, if any.
pub(crate) type LinkSlot = Option<mpsc::Sender<ClientFrame>>;

/// Sends and receives frames scoped to a single sub-channel.
///
/// Obtained from [`ConnectionManager::join_logical_channel`](crate::ConnectionManager::join_logical_channel).
/// The handle survives reconnections: sends always go to the link that is
/// open at the time of the call, and `recv` yields frames from every link
/// the sub-channel goes through.
pub struct ChannelHandle {
    pub(crate) channel: Channel,
    pub(crate) link: watch::Receiver<LinkSlot>,
    pub(crate) frames: broadcast::Receiver<ServerFrame>,
    frames_tx: broadcast::Sender<ServerFrame>,
}

impl ChannelHandle {
    pub(crate) fn new(
        channel: Channel,
        mut link: watch::Receiver<LinkSlot>,
        frames_tx: broadcast::Sender<ServerFrame>,
    ) -> Self {
        // only changes after this point are reported by `link_changed`
        link.borrow_and_update();
        Self {
            channel,
            link,
            frames: frames_tx.subscribe(),
            frames_tx,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether a send-eligible link is open right now.
    pub fn is_live(&self) -> bool {
        self.link
            .borrow()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Hand `frame` to the open link without waiting.
    ///
    /// Gives the frame back when no link is open or its buffer is full.
    pub fn try_send(&self, frame: ClientFrame) -> Result<(), ClientFrame> {
        let tx = self.link.borrow().clone();
        match tx {
            Some(tx) => tx.try_send(frame).map_err(|e| e.into_inner()),
            None => Err(frame),
        }
    }

    /// Reserve buffer space on the open link without waiting.
    pub fn try_reserve(&self) -> Option<mpsc::OwnedPermit<ClientFrame>> {
        let tx = self.link.borrow().clone()?;
        tx.try_reserve_owned().ok()
    }

    /// Send `frame`, waiting for buffer space on the open link.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ClientFrame> {
        let tx = self.link.borrow().clone();
        match tx {
            Some(tx) => tx.send(frame).await.map_err(|e| e.0),
            None => Err(frame),
        }
    }

    /// Next inbound frame on this sub-channel.
    pub async fn recv(&mut self) -> Result<ServerFrame, broadcast::error::RecvError> {
        self.frames.recv().await
    }

    /// Wait until the link is opened or closed; returns the new liveness.
    ///
    /// Errors once the connection manager is gone.
    pub async fn link_changed(&mut self) -> Result<bool, watch::error::RecvError> {
        self.link.changed().await?;
        Ok(self.link.borrow_and_update().is_some())
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            link: self.link.clone(),
            frames: self.frames_tx.subscribe(),
            frames_tx: self.frames_tx.clone(),
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel)
            .field("live", &self.is_live())
            .finish()
    }
}
