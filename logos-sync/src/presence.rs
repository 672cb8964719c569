//! Presence roster: who else has a document open.
//!
//! ```text
//!  Presence sub-channel ──► PresenceRoster::handle_frame()
//!                                 │
//!                                 ▼
//!                    HashMap<DocumentId, Vec<PeerInfo>>
//! ```

use std::collections::HashMap;
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::protocol::{ClientFrame, DocumentId, PeerInfo, ServerFrame};

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// Per-document peer lists folded from presence frames.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    documents: HashMap<DocumentId, Vec<PeerInfo>>,
    local: Option<Uuid>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound frame. Returns `true` if a roster changed.
    pub fn handle_frame(&mut self, frame: &ServerFrame) -> bool {
        match frame {
            ServerFrame::PresenceJoined { document_id, peer } => {
                if Some(peer.peer_id) == self.local {
                    return false;
                }
                let peers = self.documents.entry(*document_id).or_default();
                match peers.iter_mut().find(|p| p.peer_id == peer.peer_id) {
                    Some(existing) if existing == peer => false,
                    Some(existing) => {
                        *existing = peer.clone();
                        true
                    }
                    None => {
                        log::debug!("{} joined {document_id}", peer.name);
                        peers.push(peer.clone());
                        true
                    }
                }
            }
            ServerFrame::PresenceLeft {
                document_id,
                peer_id,
            } => {
                let Some(peers) = self.documents.get_mut(document_id) else {
                    return false;
                };
                let before = peers.len();
                peers.retain(|p| p.peer_id != *peer_id);
                before != peers.len()
            }
            ServerFrame::PresenceList { document_id, peers } => {
                let local = self.local;
                let peers: Vec<PeerInfo> = peers
                    .iter()
                    .filter(|p| Some(p.peer_id) != local)
                    .cloned()
                    .collect();
                self.documents.insert(*document_id, peers);
                true
            }
            _ => false,
        }
    }

    /// Remote peers currently viewing `document_id`.
    pub fn peers(&self, document_id: DocumentId) -> &[PeerInfo] {
        self.documents
            .get(&document_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // ───────────────────────────────────────────────────────────────
    // Outbound
    // ───────────────────────────────────────────────────────────────

    /// Announce the local peer on `document_id`.
    pub fn announce(
        &mut self,
        handle: &ChannelHandle,
        document_id: DocumentId,
        peer: PeerInfo,
    ) -> bool {
        self.local = Some(peer.peer_id);
        handle
            .try_send(ClientFrame::PresenceAnnounce { document_id, peer })
            .is_ok()
    }

    /// Leave `document_id` and forget its roster.
    pub fn leave(&mut self, handle: &ChannelHandle, document_id: DocumentId) -> bool {
        self.documents.remove(&document_id);
        handle
            .try_send(ClientFrame::PresenceLeave { document_id })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leave_list() {
        let mut roster = PresenceRoster::new();
        let doc = Uuid::new_v4();
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");

        assert!(roster.handle_frame(&ServerFrame::PresenceJoined {
            document_id: doc,
            peer: alice.clone(),
        }));
        // duplicate join is not a change
        assert!(!roster.handle_frame(&ServerFrame::PresenceJoined {
            document_id: doc,
            peer: alice.clone(),
        }));
        assert_eq!(roster.peers(doc).len(), 1);

        roster.handle_frame(&ServerFrame::PresenceList {
            document_id: doc,
            peers: vec![alice.clone(), bob.clone()],
        });
        assert_eq!(roster.peers(doc).len(), 2);

        assert!(roster.handle_frame(&ServerFrame::PresenceLeft {
            document_id: doc,
            peer_id: alice.peer_id,
        }));
        assert_eq!(roster.peers(doc), &[bob]);
        assert!(roster.peers(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_unrelated_frames_ignored() {
        let mut roster = PresenceRoster::new();
        assert!(!roster.handle_frame(&ServerFrame::Opened));
        assert!(!roster.handle_frame(&ServerFrame::Pong { timestamp: 1 }));
    }
}
