//! Document Sync Manager: per-document CRDT replicas and the sync gate.
//!
//! ```text
//!  local edit ──► record_local_update ──► pending (FIFO) ──┐
//!                                                          │ synced_once && sink live
//!  Join(sv) ──► server ──► SyncResponse ──► apply_initial_sync ──► flush ──► UpdateSink
//!  server Update ──► apply_remote_update ──► yrs merge
//! ```
//!
//! Nothing produced locally leaves a replica before its first initial sync
//! has been merged; edits still apply to the local `yrs::Doc` immediately.

use std::collections::{HashMap, VecDeque};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, TransactionMut, XmlFragmentRef};

use crate::error::FetchError;
use crate::protocol::DocumentId;

/// Root fragment holding content of current documents.
pub const PRIMARY_FRAGMENT: &str = "content";
/// Root fragment used by documents created before the content migration.
pub const LEGACY_FRAGMENT: &str = "default";

/// Which root fragment is authoritative for a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveView {
    #[default]
    Primary,
    Legacy,
}

impl ActiveView {
    pub fn fragment_name(self) -> &'static str {
        match self {
            ActiveView::Primary => PRIMARY_FRAGMENT,
            ActiveView::Legacy => LEGACY_FRAGMENT,
        }
    }
}

/// Replica sync phase. Re-opening after close starts over at `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Empty,
    AwaitingSync,
    Synced,
}

/// Observable replica state, published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub phase: SyncPhase,
    pub view: ActiveView,
    /// Local updates waiting for the sync gate or a live link
    pub pending: usize,
}

/// Outbound side of the sync protocol.
///
/// Sends never block; a sink without a live link hands the update back.
pub trait UpdateSink: Send {
    fn is_live(&self) -> bool;

    fn send_update(&self, document_id: DocumentId, update: Vec<u8>) -> Result<(), Vec<u8>>;

    /// Request the diff against `state_vector`. Returns whether it was sent.
    fn send_join(&self, document_id: DocumentId, state_vector: Vec<u8>) -> bool;

    fn send_leave(&self, document_id: DocumentId) -> bool;
}

/// What the editing surface holds for an open document.
#[derive(Clone)]
pub struct DocumentHandle {
    id: DocumentId,
    doc: Doc,
    status: watch::Receiver<ReplicaStatus>,
}

impl DocumentHandle {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn status(&self) -> ReplicaStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicaStatus> {
        self.status.clone()
    }

    /// The authoritative content fragment at the time of the call.
    pub fn fragment(&self) -> XmlFragmentRef {
        self.doc
            .get_or_insert_xml_fragment(self.status().view.fragment_name())
    }

    /// Run a local edit and return the update it produced, ready for
    /// [`DocumentSyncManager::record_local_update`].
    pub fn edit<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut, &XmlFragmentRef),
    {
        let fragment = self.fragment();
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            f(&mut txn, &fragment);
        }
        self.doc.transact().encode_diff_v1(&before)
    }

    /// Markup-free text of the authoritative fragment.
    pub fn text(&self) -> String {
        let fragment = self.fragment();
        let txn = self.doc.transact();
        strip_markup(&fragment.get_string(&txn))
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

struct Replica {
    doc: Doc,
    primary: XmlFragmentRef,
    legacy: XmlFragmentRef,
    view: ActiveView,
    phase: SyncPhase,
    synced_once: bool,
    pending: VecDeque<Vec<u8>>,
    status_tx: watch::Sender<ReplicaStatus>,
}

impl Replica {
    fn new() -> Self {
        let doc = Doc::new();
        let primary = doc.get_or_insert_xml_fragment(PRIMARY_FRAGMENT);
        let legacy = doc.get_or_insert_xml_fragment(LEGACY_FRAGMENT);
        let status_tx = watch::Sender::new(ReplicaStatus {
            phase: SyncPhase::Empty,
            view: ActiveView::Primary,
            pending: 0,
        });
        Self {
            doc,
            primary,
            legacy,
            view: ActiveView::Primary,
            phase: SyncPhase::Empty,
            synced_once: false,
            pending: VecDeque::new(),
            status_tx,
        }
    }

    fn snapshot(&self) -> ReplicaStatus {
        ReplicaStatus {
            phase: self.phase,
            view: self.view,
            pending: self.pending.len(),
        }
    }

    /// Publish the current state; `force` notifies even when nothing changed.
    fn notify(&self, force: bool) {
        let next = self.snapshot();
        if force {
            self.status_tx.send_replace(next);
        } else {
            self.status_tx.send_if_modified(|current| {
                let changed = *current != next;
                *current = next;
                changed
            });
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Merge a v1 update. A zero-length payload is a no-op.
    fn merge(&self, update: &[u8]) -> Result<(), String> {
        if update.is_empty() {
            return Ok(());
        }
        let update = yrs::Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn select_view(&self) -> ActiveView {
        let txn = self.doc.transact();
        let primary = strip_markup(&self.primary.get_string(&txn)).trim().len();
        let legacy = strip_markup(&self.legacy.get_string(&txn)).trim().len();
        if legacy > primary {
            ActiveView::Legacy
        } else {
            ActiveView::Primary
        }
    }

    /// Hand queued updates to the sink in order; stops at the first refusal.
    fn flush(&mut self, id: DocumentId, sink: &dyn UpdateSink) -> usize {
        let mut sent = 0;
        while let Some(update) = self.pending.pop_front() {
            match sink.send_update(id, update) {
                Ok(()) => sent += 1,
                Err(update) => {
                    self.pending.push_front(update);
                    break;
                }
            }
        }
        sent
    }
}

/// Text content of a serialized XML fragment, tags removed.
fn strip_markup(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut in_tag = false;
    for c in xml.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Owns every open replica. Driven from a single task.
pub struct DocumentSyncManager {
    replicas: HashMap<DocumentId, Replica>,
    sink: Box<dyn UpdateSink>,
    fetch: Option<(DocumentId, CancellationToken)>,
}

impl DocumentSyncManager {
    pub fn new(sink: Box<dyn UpdateSink>) -> Self {
        Self {
            replicas: HashMap::new(),
            sink,
            fetch: None,
        }
    }

    /// Existing replica for `id`, or a fresh empty one.
    pub fn open(&mut self, id: DocumentId) -> DocumentHandle {
        let replica = self.replicas.entry(id).or_insert_with(|| {
            log::debug!("Opening replica {id}");
            Replica::new()
        });
        DocumentHandle {
            id,
            doc: replica.doc.clone(),
            status: replica.status_tx.subscribe(),
        }
    }

    /// Request the initial sync for `id`, opening it if needed.
    pub fn join(&mut self, id: DocumentId) -> DocumentHandle {
        let handle = self.open(id);
        let Some(replica) = self.replicas.get_mut(&id) else {
            return handle;
        };
        if replica.phase == SyncPhase::Empty {
            replica.phase = SyncPhase::AwaitingSync;
            replica.notify(false);
        }
        if self.sink.is_live() {
            self.sink.send_join(id, replica.state_vector());
        }
        handle
    }

    /// Merge the server's answer to `Join` and open the sync gate.
    ///
    /// Already-synced replicas only re-notify subscribers.
    pub fn apply_initial_sync(&mut self, id: DocumentId, update: &[u8]) {
        let Some(replica) = self.replicas.get_mut(&id) else {
            log::debug!("Initial sync for unknown document {id} ignored");
            return;
        };
        if replica.synced_once {
            replica.notify(true);
            return;
        }
        if let Err(e) = replica.merge(update) {
            log::warn!("Dropping undecodable initial sync for {id}: {e}");
            return;
        }
        replica.view = replica.select_view();
        replica.synced_once = true;
        replica.phase = SyncPhase::Synced;
        let sent = replica.flush(id, self.sink.as_ref());
        log::info!(
            "Document {id} synced ({:?} view, {sent} queued updates sent)",
            replica.view
        );
        replica.notify(true);
    }

    /// Merge an update broadcast by the server. Unknown documents are ignored.
    pub fn apply_remote_update(&mut self, id: DocumentId, update: &[u8]) {
        let Some(replica) = self.replicas.get(&id) else {
            log::trace!("Update for closed document {id} ignored");
            return;
        };
        if let Err(e) = replica.merge(update) {
            log::warn!("Dropping undecodable update for {id}: {e}");
        }
    }

    /// Queue or send an update produced by a local edit.
    pub fn record_local_update(&mut self, id: DocumentId, update: Vec<u8>) {
        let Some(replica) = self.replicas.get_mut(&id) else {
            log::debug!("Local update for closed document {id} dropped");
            return;
        };
        replica.pending.push_back(update);
        if replica.synced_once {
            replica.flush(id, self.sink.as_ref());
        }
        replica.notify(false);
    }

    pub fn subscribe(&self, id: DocumentId) -> Option<watch::Receiver<ReplicaStatus>> {
        self.replicas.get(&id).map(|r| r.status_tx.subscribe())
    }

    /// Drop the replica; pending updates are discarded.
    pub fn close(&mut self, id: DocumentId, notify_server: bool) {
        if self.fetch.as_ref().is_some_and(|(doc, _)| *doc == id) {
            if let Some((_, token)) = self.fetch.take() {
                token.cancel();
            }
        }
        if self.replicas.remove(&id).is_none() {
            return;
        }
        log::debug!("Closed replica {id}");
        if notify_server && self.sink.is_live() {
            self.sink.send_leave(id);
        }
    }

    /// A send-eligible link came up: re-join every joined replica and
    /// flush synced queues.
    pub fn on_link_available(&mut self) {
        for (id, replica) in self.replicas.iter_mut() {
            if replica.phase == SyncPhase::Empty {
                continue;
            }
            self.sink.send_join(*id, replica.state_vector());
            if replica.synced_once && !replica.pending.is_empty() {
                replica.flush(*id, self.sink.as_ref());
                replica.notify(false);
            }
        }
    }

    /// Start a data fetch for `id`, superseding any fetch still in flight.
    pub fn begin_fetch(&mut self, id: DocumentId) -> CancellationToken {
        if let Some((previous, token)) = self.fetch.take() {
            log::trace!("Cancelling fetch for {previous}");
            token.cancel();
        }
        let token = CancellationToken::new();
        self.fetch = Some((id, token.clone()));
        token
    }

    /// Merge fetched state unless the fetch was superseded.
    pub fn apply_fetched(
        &mut self,
        token: &CancellationToken,
        id: DocumentId,
        update: &[u8],
    ) -> Result<(), FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if !self.replicas.contains_key(&id) {
            return Err(FetchError::UnknownDocument);
        }
        self.apply_remote_update(id, update);
        // an uncancelled token for `id` is the current fetch
        if self.fetch.as_ref().is_some_and(|(doc, _)| *doc == id) {
            self.fetch = None;
        }
        Ok(())
    }

    pub fn status(&self, id: DocumentId) -> Option<ReplicaStatus> {
        self.replicas.get(&id).map(Replica::snapshot)
    }

    pub fn is_synced(&self, id: DocumentId) -> bool {
        self.replicas.get(&id).is_some_and(|r| r.synced_once)
    }

    pub fn pending_len(&self, id: DocumentId) -> usize {
        self.replicas.get(&id).map_or(0, |r| r.pending.len())
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        self.replicas.keys().copied().collect()
    }

    /// Full state of `id` as a v1 update.
    pub fn encode_state(&self, id: DocumentId) -> Option<Vec<u8>> {
        let replica = self.replicas.get(&id)?;
        let txn = replica.doc.transact();
        Some(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}
