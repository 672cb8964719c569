//! Bridge between the document sync manager and the collaboration
//! sub-channel.
//!
//! The [`SyncDriver`] task owns the [`DocumentSyncManager`] and is the only
//! place it is mutated: commands from [`DocumentSync`] handles, inbound
//! collaboration frames and link changes are all applied in arrival order.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::ChannelHandle;
use crate::connection::ConnectionManager;
use crate::document::{DocumentHandle, DocumentSyncManager, ReplicaStatus, UpdateSink};
use crate::protocol::{Channel, ClientFrame, DocumentId, ServerFrame};

/// [`UpdateSink`] writing to the collaboration sub-channel.
pub struct ChannelSink {
    handle: ChannelHandle,
}

impl ChannelSink {
    pub fn new(handle: ChannelHandle) -> Self {
        Self { handle }
    }
}

impl UpdateSink for ChannelSink {
    fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    fn send_update(&self, document_id: DocumentId, update: Vec<u8>) -> Result<(), Vec<u8>> {
        let Some(permit) = self.handle.try_reserve() else {
            return Err(update);
        };
        permit.send(ClientFrame::Update {
            document_id,
            update,
        });
        Ok(())
    }

    fn send_join(&self, document_id: DocumentId, state_vector: Vec<u8>) -> bool {
        let sent = self
            .handle
            .try_send(ClientFrame::Join {
                document_id,
                state_vector,
            })
            .is_ok();
        if !sent {
            log::debug!("Join for {document_id} deferred until the link is up");
        }
        sent
    }

    fn send_leave(&self, document_id: DocumentId) -> bool {
        self.handle
            .try_send(ClientFrame::Leave { document_id })
            .is_ok()
    }
}

enum SyncCommand {
    Open {
        id: DocumentId,
        join: bool,
        reply: oneshot::Sender<DocumentHandle>,
    },
    LocalUpdate {
        id: DocumentId,
        update: Vec<u8>,
    },
    Close {
        id: DocumentId,
        notify_server: bool,
    },
    Status {
        id: DocumentId,
        reply: oneshot::Sender<Option<ReplicaStatus>>,
    },
}

/// Handle to a running [`SyncDriver`]. Cheap to clone.
#[derive(Clone)]
pub struct DocumentSync {
    cmd_tx: mpsc::Sender<SyncCommand>,
}

impl DocumentSync {
    /// Open `id` locally without syncing.
    pub async fn open(&self, id: DocumentId) -> Option<DocumentHandle> {
        self.request_handle(id, false).await
    }

    /// Open `id` and request its initial sync.
    pub async fn join(&self, id: DocumentId) -> Option<DocumentHandle> {
        self.request_handle(id, true).await
    }

    async fn request_handle(&self, id: DocumentId, join: bool) -> Option<DocumentHandle> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncCommand::Open { id, join, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Submit an update produced by a local edit.
    pub async fn record_local_update(&self, id: DocumentId, update: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(SyncCommand::LocalUpdate { id, update })
            .await;
    }

    pub async fn close(&self, id: DocumentId, notify_server: bool) {
        let _ = self
            .cmd_tx
            .send(SyncCommand::Close { id, notify_server })
            .await;
    }

    pub async fn status(&self, id: DocumentId) -> Option<ReplicaStatus> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncCommand::Status { id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Single task applying collaboration traffic to the replicas.
pub struct SyncDriver {
    documents: DocumentSyncManager,
    handle: ChannelHandle,
    commands: mpsc::Receiver<SyncCommand>,
}

impl SyncDriver {
    /// Spawn a driver bound to the manager's collaboration sub-channel.
    pub fn spawn(manager: &ConnectionManager) -> (DocumentSync, JoinHandle<()>) {
        let handle = manager.join_logical_channel(Channel::Collaboration);
        let documents = DocumentSyncManager::new(Box::new(ChannelSink::new(handle.clone())));
        let (cmd_tx, commands) = mpsc::channel(256);
        let driver = Self {
            documents,
            handle,
            commands,
        };
        (DocumentSync { cmd_tx }, tokio::spawn(driver.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                frame = self.handle.frames.recv() => match frame {
                    Ok(frame) => self.on_frame(frame),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Missed {missed} collaboration frames, re-joining documents");
                        self.documents.on_link_available();
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = self.handle.link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let live = self.handle.link.borrow_and_update().is_some();
                    if live {
                        log::debug!("Collaboration link up, resyncing documents");
                        self.documents.on_link_available();
                    }
                }
            }
        }
        log::debug!("Sync driver stopped");
    }

    fn on_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Open { id, join, reply } => {
                let handle = if join {
                    self.documents.join(id)
                } else {
                    self.documents.open(id)
                };
                let _ = reply.send(handle);
            }
            SyncCommand::LocalUpdate { id, update } => {
                self.documents.record_local_update(id, update);
            }
            SyncCommand::Close { id, notify_server } => {
                self.documents.close(id, notify_server);
            }
            SyncCommand::Status { id, reply } => {
                let _ = reply.send(self.documents.status(id));
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SyncResponse {
                document_id,
                update,
            } => {
                if self.documents.is_synced(document_id) {
                    // answer to a re-join: merge the diff, then re-notify
                    self.documents.apply_remote_update(document_id, &update);
                }
                self.documents.apply_initial_sync(document_id, &update);
            }
            ServerFrame::Update {
                document_id,
                update,
            } => self.documents.apply_remote_update(document_id, &update),
            ServerFrame::Error { category, code } => {
                log::warn!("Collaboration error {category:?} ({code})");
            }
            other => log::trace!("Ignoring collaboration frame {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::credential::StaticCredential;
    use crate::document::tests::paragraph_update;
    use crate::document::{SyncPhase, PRIMARY_FRAGMENT};
    use crate::memory::{MemoryPeer, MemoryTransport};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn connected() -> (ConnectionManager, MemoryTransport) {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(StaticCredential::new(None)),
        );
        manager.connect(false).await.unwrap();
        (manager, transport)
    }

    #[test]
    fn test_sink_hands_back_update_when_link_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_link_tx, link_rx) = tokio::sync::watch::channel(Some(tx));
        let (frames_tx, _) = tokio::sync::broadcast::channel(4);
        let sink = ChannelSink::new(ChannelHandle::new(Channel::Collaboration, link_rx, frames_tx));
        let id = Uuid::new_v4();

        assert_eq!(sink.send_update(id, vec![1]), Ok(()));
        assert_eq!(sink.send_update(id, vec![2]), Err(vec![2]));
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientFrame::Update {
                document_id: id,
                update: vec![1]
            }
        );
    }

    #[test]
    fn test_sink_hands_back_update_without_link() {
        let (_link_tx, link_rx) = tokio::sync::watch::channel(None);
        let (frames_tx, _) = tokio::sync::broadcast::channel(4);
        let sink = ChannelSink::new(ChannelHandle::new(Channel::Collaboration, link_rx, frames_tx));

        assert_eq!(sink.send_update(Uuid::new_v4(), vec![7]), Err(vec![7]));
    }

    async fn next_sync_frame(peer: &mut MemoryPeer) -> ClientFrame {
        loop {
            match peer.received.recv().await.expect("link open") {
                ClientFrame::Ping { .. } => continue,
                frame => return frame,
            }
        }
    }

    #[tokio::test]
    async fn test_join_sync_and_flush() {
        let (manager, transport) = connected().await;
        let mut peer = transport.take_peer(Channel::Collaboration).unwrap();
        let (sync, _task) = SyncDriver::spawn(&manager);
        let id = Uuid::new_v4();

        let handle = sync.join(id).await.unwrap();
        assert!(matches!(
            next_sync_frame(&mut peer).await,
            ClientFrame::Join { document_id, .. } if document_id == id
        ));

        let local = handle.edit(|txn, fragment| {
            yrs::XmlFragment::insert(fragment, txn, 0, yrs::XmlTextPrelim::new("draft"));
        });
        sync.record_local_update(id, local.clone()).await;
        assert_eq!(sync.status(id).await.unwrap().pending, 1);

        let mut status = handle.subscribe();
        peer.sender
            .send(ServerFrame::SyncResponse {
                document_id: id,
                update: paragraph_update(PRIMARY_FRAGMENT, "server"),
            })
            .await
            .unwrap();
        status
            .wait_for(|s| s.phase == SyncPhase::Synced)
            .await
            .unwrap();

        assert_eq!(
            next_sync_frame(&mut peer).await,
            ClientFrame::Update {
                document_id: id,
                update: local
            }
        );
        assert!(handle.text().contains("server"));
        assert!(handle.text().contains("draft"));
    }

    #[tokio::test]
    async fn test_remote_update_merged() {
        let (manager, transport) = connected().await;
        let peer = transport.take_peer(Channel::Collaboration).unwrap();
        let (sync, _task) = SyncDriver::spawn(&manager);
        let id = Uuid::new_v4();
        let handle = sync.open(id).await.unwrap();

        peer.sender
            .send(ServerFrame::Update {
                document_id: id,
                update: paragraph_update(PRIMARY_FRAGMENT, "remote"),
            })
            .await
            .unwrap();
        // status round trip orders us after the frame
        for _ in 0..50 {
            if handle.text() == "remote" {
                break;
            }
            tokio::task::yield_now().await;
            let _ = sync.status(id).await;
        }
        assert_eq!(handle.text(), "remote");
    }
}
