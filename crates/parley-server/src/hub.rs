//! Realtime broadcast hub.
//!
//! Every live connection moves through `Connecting -> Admitted -> Active ->
//! Closed`. Admission verifies the presented session token and binds the
//! resulting identity to the connection for its whole lifetime. Active
//! connections form the broadcast set; each owns a bounded outbound queue
//! drained by its transport writer.
//!
//! All fan-out and all membership changes go through one mutex around the
//! broadcast set, so messages from a single sender reach every peer in the
//! order the hub accepted them. Registry I/O happens before that lock is
//! taken, never under it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_shared::constants::DEFAULT_FILE_CAPTION;
use parley_shared::protocol::{
    download_url, BroadcastMessage, ClientEvent, ErrorCode, FileMessage, ProtocolViolation,
    ServerEvent, TextMessage,
};
use parley_shared::token::TokenService;
use parley_shared::types::Identity;
use parley_store::FileRegistry;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::rate_limit::RateLimiter;

/// Hub-local connection handle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Token presented, not yet verified.
    Connecting,
    /// Identity verified and bound.
    Admitted,
    /// Member of the broadcast set.
    Active,
    /// Refused, disconnected, or dropped after a delivery failure.
    Closed,
}

/// An admitted connection. The identity never changes after admission.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub admitted_at: DateTime<Utc>,
}

/// Result of a successful admission: the connection handle plus the stream
/// of events the transport must deliver to the client.
#[derive(Debug)]
pub struct Admission {
    pub connection: Connection,
    pub events: mpsc::Receiver<ServerEvent>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub outbound_queue: usize,
    pub max_protocol_violations: u32,
    /// Sustained inbound messages per second per connection.
    pub message_rate: f64,
    pub message_burst: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            max_protocol_violations: 5,
            message_rate: 5.0,
            message_burst: 20.0,
        }
    }
}

struct Peer {
    identity: Identity,
    outbound: mpsc::Sender<ServerEvent>,
    violations: u32,
}

#[derive(Default)]
struct BroadcastSet {
    peers: HashMap<ConnectionId, Peer>,
    seq: u64,
}

impl BroadcastSet {
    /// Queue `event` for one peer; a full or closed queue removes the peer.
    fn deliver(&mut self, id: ConnectionId, event: ServerEvent) -> bool {
        let Some(peer) = self.peers.get(&id) else {
            return false;
        };
        if peer.outbound.try_send(event).is_ok() {
            return true;
        }
        self.drop_peer(id, "outbound queue full or closed");
        false
    }

    fn drop_peer(&mut self, id: ConnectionId, reason: &str) {
        if let Some(peer) = self.peers.remove(&id) {
            warn!(
                conn = %id,
                identity = %peer.identity,
                reason,
                peers = self.peers.len(),
                "Connection closed by hub"
            );
        }
    }
}

pub struct Hub {
    tokens: Arc<TokenService>,
    registry: Arc<FileRegistry>,
    config: HubConfig,
    set: Mutex<BroadcastSet>,
    next_id: AtomicU64,
    flood: RateLimiter<ConnectionId>,
}

impl Hub {
    pub fn new(tokens: Arc<TokenService>, registry: Arc<FileRegistry>, config: HubConfig) -> Self {
        let flood = RateLimiter::new(config.message_rate, config.message_burst);
        Self {
            tokens,
            registry,
            config,
            set: Mutex::new(BroadcastSet::default()),
            next_id: AtomicU64::new(1),
            flood,
        }
    }

    /// Verify the token a connecting client presented. This is the only
    /// admission gate; nothing from the transport is accepted before it.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, HubError> {
        debug!(state = ?ConnectionState::Connecting, "Verifying session token");
        let token = token
            .filter(|t| !t.trim().is_empty())
            .ok_or(HubError::MissingToken)?;

        match self.tokens.verify(token) {
            Ok(identity) => {
                debug!(identity = %identity, state = ?ConnectionState::Admitted, "Token accepted");
                Ok(identity)
            }
            Err(e) => {
                warn!(reason = %e, state = ?ConnectionState::Closed, "Connection refused");
                Err(e.into())
            }
        }
    }

    /// Add an authenticated identity to the broadcast set.
    pub async fn join(&self, identity: Identity) -> Admission {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, events) = mpsc::channel(self.config.outbound_queue.max(1));
        let connection = Connection {
            id,
            identity: identity.clone(),
            admitted_at: Utc::now(),
        };

        let mut set = self.set.lock().await;
        set.peers.insert(
            id,
            Peer {
                identity: identity.clone(),
                outbound,
                violations: 0,
            },
        );
        let peers = set.peers.len();
        set.deliver(
            id,
            ServerEvent::Welcome {
                identity: identity.clone(),
                peers,
            },
        );

        info!(
            conn = %id,
            identity = %identity,
            peers,
            state = ?ConnectionState::Active,
            "Connection admitted"
        );

        Admission { connection, events }
    }

    /// `authenticate` followed by `join`.
    #[allow(dead_code)]
    pub async fn admit(&self, token: Option<&str>) -> Result<Admission, HubError> {
        let identity = self.authenticate(token)?;
        Ok(self.join(identity).await)
    }

    /// Parse one inbound text frame and dispatch it.
    ///
    /// Returns the number of peers the resulting message was queued for.
    pub async fn handle_inbound(&self, conn: &Connection, raw: &str) -> Result<usize, HubError> {
        if !self.flood.check(conn.id).await {
            return Err(self.report_violation(conn, ProtocolViolation::Flooding).await);
        }

        match ClientEvent::parse(raw) {
            Ok(ClientEvent::Text { text }) => self.broadcast_text(conn, &text).await,
            Ok(ClientEvent::File { text, file_id }) => {
                self.broadcast_file(conn, &text, file_id).await
            }
            Err(violation) => Err(self.report_violation(conn, violation).await),
        }
    }

    /// Drop an offending message: tell the sender, count it, and close the
    /// connection once it crosses the configured limit.
    pub async fn report_violation(&self, conn: &Connection, violation: ProtocolViolation) -> HubError {
        warn!(conn = %conn.id, identity = %conn.identity, error = %violation, "Protocol violation");

        let mut set = self.set.lock().await;
        let Some(peer) = set.peers.get_mut(&conn.id) else {
            return HubError::NotActive(conn.id);
        };
        peer.violations += 1;
        let exceeded = peer.violations >= self.config.max_protocol_violations;

        set.deliver(
            conn.id,
            ServerEvent::error(ErrorCode::ProtocolViolation, violation.to_string()),
        );

        if exceeded {
            set.drop_peer(conn.id, "too many protocol violations");
            drop(set);
            self.flood.forget(&conn.id).await;
            return HubError::TooManyViolations(conn.id);
        }

        HubError::Protocol(violation)
    }

    pub async fn broadcast_text(&self, conn: &Connection, text: &str) -> Result<usize, HubError> {
        if text.is_empty() {
            warn!(conn = %conn.id, identity = %conn.identity, "Dropping empty message");
            return Err(HubError::EmptyMessage);
        }

        let text = text.to_string();
        self.fan_out(conn, |seq, sent_at| {
            BroadcastMessage::Text(TextMessage {
                sender: conn.identity.clone(),
                text,
                seq,
                sent_at,
            })
        })
        .await
    }

    /// Broadcast a message referencing a registered file. Unknown or vanished
    /// files are reported to the sender only.
    pub async fn broadcast_file(
        &self,
        conn: &Connection,
        text: &str,
        file_id: Uuid,
    ) -> Result<usize, HubError> {
        let record = match self.registry.exists_on_disk(&file_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(conn = %conn.id, file_id = %file_id, error = %e, "Rejecting file message");
                let mut set = self.set.lock().await;
                if !set.peers.contains_key(&conn.id) {
                    return Err(HubError::NotActive(conn.id));
                }
                set.deliver(
                    conn.id,
                    ServerEvent::error(ErrorCode::FileNotFound, "File not found"),
                );
                return Err(HubError::FileNotFound(file_id));
            }
        };

        let text = if text.is_empty() {
            DEFAULT_FILE_CAPTION.to_string()
        } else {
            text.to_string()
        };

        self.fan_out(conn, |seq, sent_at| {
            BroadcastMessage::File(FileMessage {
                sender: conn.identity.clone(),
                text,
                file_id,
                file_name: record.original_name,
                url: download_url(&file_id),
                seq,
                sent_at,
            })
        })
        .await
    }

    /// Remove a connection from the broadcast set. Safe to call any number of
    /// times.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut set = self.set.lock().await;
            let removed = set.peers.remove(&id);
            removed.map(|peer| (peer.identity, set.peers.len()))
        };

        self.flood.forget(&id).await;

        match removed {
            Some((identity, peers)) => {
                info!(conn = %id, identity = %identity, peers, state = ?ConnectionState::Closed, "Connection closed");
                true
            }
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.set.lock().await.peers.len()
    }

    #[allow(dead_code)]
    pub async fn state_of(&self, id: ConnectionId) -> ConnectionState {
        if self.set.lock().await.peers.contains_key(&id) {
            ConnectionState::Active
        } else {
            ConnectionState::Closed
        }
    }

    /// Deliver one message to every active connection, sender included.
    /// Runs entirely under the broadcast-set lock.
    async fn fan_out(
        &self,
        conn: &Connection,
        build: impl FnOnce(u64, DateTime<Utc>) -> BroadcastMessage,
    ) -> Result<usize, HubError> {
        let mut set = self.set.lock().await;
        if !set.peers.contains_key(&conn.id) {
            return Err(HubError::NotActive(conn.id));
        }

        set.seq += 1;
        let message = build(set.seq, Utc::now());
        let sender = message.sender().clone();
        let event = ServerEvent::from(message);

        let targets: Vec<ConnectionId> = set.peers.keys().copied().collect();
        let mut delivered = 0;
        for id in targets {
            if set.deliver(id, event.clone()) {
                delivered += 1;
            }
        }

        debug!(conn = %conn.id, sender = %sender, seq = set.seq, delivered, "Broadcast");
        Ok(delivered)
    }
}
