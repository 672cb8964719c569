//! In-process sync authority speaking the envelope protocol over WebSocket.

#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use logos_sync::protocol::{ErrorCategory, AUTH_INVALID};
use logos_sync::{Channel, ClientFrame, DocumentId, Envelope, PeerInfo, ServerFrame};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact};

/// Unsigned JWT-shaped token expiring at `exp` (Unix seconds).
pub fn unsigned_token(exp: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.")
}

/// Update fan-out: (origin connection, document, update).
type Relay = (u64, DocumentId, Vec<u8>);

struct AuthorityState {
    docs: Mutex<HashMap<DocumentId, yrs::Doc>>,
    relay: broadcast::Sender<Relay>,
    kill: broadcast::Sender<()>,
    answer_pings: AtomicBool,
    /// Connections with an id below this never answer again
    silent_below: AtomicU64,
    accepted_token: Mutex<Option<String>>,
    connections: AtomicUsize,
    next_conn: AtomicU64,
    received: Mutex<Vec<ClientFrame>>,
}

/// Running mock authority.
#[derive(Clone)]
pub struct MockAuthority {
    pub url: String,
    state: Arc<AuthorityState>,
}

impl MockAuthority {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(AuthorityState {
            docs: Mutex::new(HashMap::new()),
            relay: broadcast::channel(256).0,
            kill: broadcast::channel(4).0,
            answer_pings: AtomicBool::new(true),
            silent_below: AtomicU64::new(0),
            accepted_token: Mutex::new(None),
            connections: AtomicUsize::new(0),
            next_conn: AtomicU64::new(1),
            received: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        log::debug!("Mock connection ended: {e}");
                    }
                });
            }
        });

        Self { url, state }
    }

    /// Reject `Open` unless it carries `token`.
    pub fn require_token(&self, token: &str) {
        *self.state.accepted_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Stop answering on every socket open right now, without closing them.
    /// Sockets accepted later behave normally.
    pub fn go_silent(&self) {
        let next = self.state.next_conn.load(Ordering::SeqCst);
        self.state.silent_below.store(next, Ordering::SeqCst);
    }

    /// Close every open socket.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Physical sockets accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ClientFrame> {
        self.state.received.lock().unwrap().clone()
    }

    /// Authority's copy of a document as a full v1 update.
    pub fn document_state(&self, id: DocumentId) -> Option<Vec<u8>> {
        let docs = self.state.docs.lock().unwrap();
        let doc = docs.get(&id)?;
        let txn = doc.transact();
        Some(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<AuthorityState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    state.connections.fetch_add(1, Ordering::SeqCst);
    let conn_id = state.next_conn.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope<ServerFrame>>(256);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let Ok(bytes) = envelope.encode() else {
                continue;
            };
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut relay_rx = state.relay.subscribe();
    let mut kill_rx = state.kill.subscribe();
    let mut joined: HashSet<DocumentId> = HashSet::new();
    let mut open: HashSet<Channel> = HashSet::new();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let bytes: Vec<u8> = match msg {
                    Some(Ok(Message::Binary(data))) => data.into(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let envelope = Envelope::<ClientFrame>::decode(&bytes)?;
                state.received.lock().unwrap().push(envelope.frame.clone());
                if conn_id < state.silent_below.load(Ordering::SeqCst) {
                    continue;
                }
                let replies = handle_frame(&state, conn_id, envelope, &mut joined, &mut open);
                for reply in replies {
                    out_tx.send(reply).await?;
                }
            }
            relayed = relay_rx.recv() => {
                let Ok((origin, document_id, update)) = relayed else {
                    continue;
                };
                let silent = conn_id < state.silent_below.load(Ordering::SeqCst);
                if !silent && origin != conn_id && joined.contains(&document_id) {
                    out_tx
                        .send(Envelope::new(
                            Channel::Collaboration,
                            ServerFrame::Update { document_id, update },
                        ))
                        .await?;
                }
            }
            _ = kill_rx.recv() => break,
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn handle_frame(
    state: &AuthorityState,
    conn_id: u64,
    envelope: Envelope<ClientFrame>,
    joined: &mut HashSet<DocumentId>,
    open: &mut HashSet<Channel>,
) -> Vec<Envelope<ServerFrame>> {
    let channel = envelope.channel;
    let reply = |frame| vec![Envelope::new(channel, frame)];
    match envelope.frame {
        ClientFrame::Open { credential } => {
            let required = state.accepted_token.lock().unwrap().clone();
            if required.is_some() && credential != required {
                return reply(ServerFrame::Error {
                    category: ErrorCategory::Auth,
                    code: AUTH_INVALID,
                });
            }
            open.insert(channel);
            reply(ServerFrame::Opened)
        }
        ClientFrame::Close => {
            open.remove(&channel);
            Vec::new()
        }
        ClientFrame::Ping { timestamp } if state.answer_pings.load(Ordering::SeqCst) => {
            reply(ServerFrame::Pong { timestamp })
        }
        ClientFrame::Join {
            document_id,
            state_vector,
        } => {
            joined.insert(document_id);
            let mut docs = state.docs.lock().unwrap();
            let doc = docs.entry(document_id).or_insert_with(yrs::Doc::new);
            let remote = StateVector::decode_v1(&state_vector).unwrap_or_default();
            let update = doc.transact().encode_diff_v1(&remote);
            reply(ServerFrame::SyncResponse {
                document_id,
                update,
            })
        }
        ClientFrame::Leave { document_id } => {
            joined.remove(&document_id);
            Vec::new()
        }
        ClientFrame::Update {
            document_id,
            update,
        } => {
            {
                let mut docs = state.docs.lock().unwrap();
                let doc = docs.entry(document_id).or_insert_with(yrs::Doc::new);
                if let Ok(decoded) = yrs::Update::decode_v1(&update) {
                    let _ = doc.transact_mut().apply_update(decoded);
                }
            }
            let _ = state.relay.send((conn_id, document_id, update));
            Vec::new()
        }
        ClientFrame::PresenceAnnounce { document_id, peer } => {
            reply(ServerFrame::PresenceList {
                document_id,
                peers: vec![peer, PeerInfo::with_id(Uuid::nil(), "Authority")],
            })
        }
        ClientFrame::Chat { room, body } => reply(ServerFrame::Chat {
            room,
            author: Uuid::nil(),
            body,
        }),
        _ => Vec::new(),
    }
}
