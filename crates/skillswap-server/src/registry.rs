//! Connection registry actor.
//!
//! One control-loop task owns the index of live sessions. Everything else
//! talks to it through a [`RegistryHandle`], which wraps the bounded command
//! queue. Outbound frames are pushed with `try_send`: a session whose queue
//! is full loses the frame and is evicted, so one slow reader never stalls
//! the loop or its peers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skillswap_shared::constants::REGISTRY_COMMAND_CAPACITY;
use skillswap_shared::protocol::PeerPresence;
use skillswap_shared::{Frame, ResourceId, UserId};

use crate::error::ServerError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection registry has shut down")]
    Closed,
}

/// Durable delivered-state for persisted messages, consulted by the
/// control loop. Both calls run inside the loop, so an admission replay and
/// a live delivery of the same message are serialized.
pub trait DeliveryLedger: Send + Sync {
    /// Runs right after a session is installed and before any other command
    /// is handled. Enqueues whatever the user has not received yet.
    fn on_admit(&self, user_id: UserId, outbox: &mpsc::Sender<Frame>);

    /// Flip `message_id` to delivered. `Ok(false)` means it already was,
    /// so the frame must not be sent again.
    fn claim(&self, message_id: i64) -> Result<bool, ServerError>;
}

/// What a newly admitted connection gets back from the registry.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: UserId,
    /// Closed by the registry when the session is evicted or replaced.
    pub outbound: mpsc::Receiver<Frame>,
}

/// Snapshot of a live session, for presence queries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub joined_resources: Vec<ResourceId>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Enqueued,
    /// Already marked delivered, by an admission replay or an earlier send.
    AlreadyDelivered,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// A newer connection for the same user took the slot.
    Replaced,
    /// The outbound queue was full.
    Overflow,
}

/// Notifications published by the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Connected {
        user_id: UserId,
        session_id: Uuid,
    },
    Disconnected {
        user_id: UserId,
        session_id: Uuid,
    },
    Evicted {
        user_id: UserId,
        session_id: Uuid,
        reason: EvictReason,
    },
}

#[derive(Debug, Default)]
struct RegistryMetrics {
    frames_dropped: AtomicU64,
    overflow_evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounters {
    pub frames_dropped: u64,
    pub overflow_evictions: u64,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub queue_capacity: usize,
}

enum Command {
    Connect {
        user_id: UserId,
        reply: oneshot::Sender<Session>,
    },
    Disconnect {
        user_id: UserId,
        session_id: Uuid,
    },
    Deliver {
        user_id: UserId,
        frame: Frame,
        message_id: i64,
        reply: oneshot::Sender<DeliveryOutcome>,
    },
    Unicast {
        user_id: UserId,
        frame: Frame,
    },
    BroadcastToResource {
        resource_id: ResourceId,
        frame: Frame,
    },
    BroadcastExcept {
        user_id: UserId,
        frame: Frame,
    },
    Join {
        user_id: UserId,
        session_id: Uuid,
        resource_id: ResourceId,
    },
    Leave {
        user_id: UserId,
        session_id: Uuid,
        resource_id: ResourceId,
    },
    Touch {
        user_id: UserId,
        session_id: Uuid,
    },
    IsOnline {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    OnlineUsers {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown,
}

/// Cheap, cloneable handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<RegistryEvent>,
    metrics: Arc<RegistryMetrics>,
}

/// Spawn the control loop and return a handle to it.
pub fn spawn_registry(
    config: RegistryConfig,
    ledger: Option<Arc<dyn DeliveryLedger>>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(REGISTRY_COMMAND_CAPACITY);
    let (events, _) = broadcast::channel(256);
    let metrics = Arc::new(RegistryMetrics::default());

    let registry = Registry {
        sessions: HashMap::new(),
        capacity: config.queue_capacity.max(1),
        ledger,
        events: events.clone(),
        metrics: metrics.clone(),
    };
    tokio::spawn(registry.run(cmd_rx));

    RegistryHandle {
        cmd_tx,
        events,
        metrics,
    }
}

impl RegistryHandle {
    /// Admit a connection for `user_id`, replacing any previous one.
    pub async fn connect(&self, user_id: UserId) -> Result<Session, RegistryError> {
        self.request(|reply| Command::Connect { user_id, reply })
            .await
    }

    pub async fn disconnect(&self, user_id: UserId, session_id: Uuid) {
        self.send(Command::Disconnect {
            user_id,
            session_id,
        })
        .await;
    }

    /// Acknowledged unicast for persisted messages.
    pub async fn deliver(
        &self,
        user_id: UserId,
        frame: Frame,
        message_id: i64,
    ) -> Result<DeliveryOutcome, RegistryError> {
        self.request(|reply| Command::Deliver {
            user_id,
            frame,
            message_id,
            reply,
        })
        .await
    }

    /// Fire-and-forget; dropped when the user is offline.
    pub async fn unicast(&self, user_id: UserId, frame: Frame) {
        self.send(Command::Unicast { user_id, frame }).await;
    }

    pub async fn broadcast_to_resource(&self, resource_id: ResourceId, frame: Frame) {
        self.send(Command::BroadcastToResource { resource_id, frame })
            .await;
    }

    pub async fn broadcast_except(&self, user_id: UserId, frame: Frame) {
        self.send(Command::BroadcastExcept { user_id, frame }).await;
    }

    pub async fn join(&self, user_id: UserId, session_id: Uuid, resource_id: ResourceId) {
        self.send(Command::Join {
            user_id,
            session_id,
            resource_id,
        })
        .await;
    }

    pub async fn leave(&self, user_id: UserId, session_id: Uuid, resource_id: ResourceId) {
        self.send(Command::Leave {
            user_id,
            session_id,
            resource_id,
        })
        .await;
    }

    pub async fn touch(&self, user_id: UserId, session_id: Uuid) {
        self.send(Command::Touch {
            user_id,
            session_id,
        })
        .await;
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, RegistryError> {
        self.request(|reply| Command::IsOnline { user_id, reply })
            .await
    }

    pub async fn online_users(&self) -> Result<Vec<SessionInfo>, RegistryError> {
        self.request(|reply| Command::OnlineUsers { reply }).await
    }

    /// Stop the control loop. Every session queue closes with it.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn counters(&self) -> RegistryCounters {
        RegistryCounters {
            frames_dropped: self.metrics.frames_dropped.load(Ordering::Relaxed),
            overflow_evictions: self.metrics.overflow_evictions.load(Ordering::Relaxed),
        }
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            debug!("Registry command dropped after shutdown");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }
}

struct SessionEntry {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
    joined: HashSet<ResourceId>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl SessionEntry {
    fn info(&self, user_id: UserId) -> SessionInfo {
        let mut joined_resources: Vec<_> = self.joined.iter().copied().collect();
        joined_resources.sort();
        SessionInfo {
            session_id: self.id,
            user_id,
            joined_resources,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
        }
    }
}

/// Why a session leaves the index.
#[derive(Debug, Clone, Copy)]
enum Removal {
    Disconnected,
    /// Write side already gone; the socket task has not reported yet.
    Closed,
    Overflow,
}

struct Registry {
    sessions: HashMap<UserId, SessionEntry>,
    capacity: usize,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    events: broadcast::Sender<RegistryEvent>,
    metrics: Arc<RegistryMetrics>,
}

impl Registry {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        info!(capacity = self.capacity, "Connection registry started");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Connect { user_id, reply } => {
                    let session = self.connect(user_id);
                    if let Err(session) = reply.send(session) {
                        // The caller went away mid-handshake.
                        self.disconnect(user_id, session.id);
                    }
                }
                Command::Disconnect {
                    user_id,
                    session_id,
                } => self.disconnect(user_id, session_id),
                Command::Deliver {
                    user_id,
                    frame,
                    message_id,
                    reply,
                } => {
                    let outcome = self.deliver(user_id, frame, message_id);
                    let _ = reply.send(outcome);
                }
                Command::Unicast { user_id, frame } => {
                    if !self.push(user_id, frame) {
                        debug!(user = %user_id, "Unicast target offline, frame dropped");
                    }
                }
                Command::BroadcastToResource { resource_id, frame } => {
                    self.fan_out(&frame, |_, entry| entry.joined.contains(&resource_id));
                }
                Command::BroadcastExcept { user_id, frame } => {
                    self.fan_out(&frame, |uid, _| uid != user_id);
                }
                Command::Join {
                    user_id,
                    session_id,
                    resource_id,
                } => {
                    if let Some(entry) = self.entry_mut(user_id, session_id) {
                        entry.joined.insert(resource_id);
                        entry.last_seen = Utc::now();
                    }
                }
                Command::Leave {
                    user_id,
                    session_id,
                    resource_id,
                } => {
                    if let Some(entry) = self.entry_mut(user_id, session_id) {
                        entry.joined.remove(&resource_id);
                        entry.last_seen = Utc::now();
                    }
                }
                Command::Touch {
                    user_id,
                    session_id,
                } => {
                    if let Some(entry) = self.entry_mut(user_id, session_id) {
                        entry.last_seen = Utc::now();
                    }
                }
                Command::IsOnline { user_id, reply } => {
                    let _ = reply.send(self.sessions.contains_key(&user_id));
                }
                Command::OnlineUsers { reply } => {
                    let mut infos: Vec<_> = self
                        .sessions
                        .iter()
                        .map(|(uid, entry)| entry.info(*uid))
                        .collect();
                    infos.sort_by_key(|info| info.user_id);
                    let _ = reply.send(infos);
                }
                Command::Shutdown => {
                    info!(sessions = self.sessions.len(), "Connection registry shutting down");
                    break;
                }
            }
        }

        self.sessions.clear();
        info!("Connection registry stopped");
    }

    fn connect(&mut self, user_id: UserId) -> Session {
        if let Some(old) = self.sessions.remove(&user_id) {
            info!(user = %user_id, session = %old.id, "Replacing existing session");
            self.emit(RegistryEvent::Evicted {
                user_id,
                session_id: old.id,
                reason: EvictReason::Replaced,
            });
            // Dropping `old.tx` closes its queue and ends its write task.
        }

        let (tx, outbound) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let now = Utc::now();

        if let Some(ledger) = &self.ledger {
            ledger.on_admit(user_id, &tx);
        }

        self.sessions.insert(
            user_id,
            SessionEntry {
                id,
                tx,
                joined: HashSet::new(),
                connected_at: now,
                last_seen: now,
            },
        );

        info!(user = %user_id, session = %id, online = self.sessions.len(), "Session admitted");
        self.emit(RegistryEvent::Connected {
            user_id,
            session_id: id,
        });

        let presence = Frame::PeerConnect(PeerPresence { user_id });
        self.fan_out(&presence, |uid, _| uid != user_id);

        Session {
            id,
            user_id,
            outbound,
        }
    }

    fn disconnect(&mut self, user_id: UserId, session_id: Uuid) {
        match self.sessions.get(&user_id) {
            Some(entry) if entry.id == session_id => {
                self.remove_sessions(vec![(user_id, Removal::Disconnected)]);
            }
            _ => {
                debug!(user = %user_id, session = %session_id, "Stale disconnect ignored");
            }
        }
    }

    /// Reserve a queue slot, claim the message in the ledger, then send.
    /// A frame is never queued for a message that is already delivered, and
    /// a message is never marked delivered without a slot to land in.
    fn deliver(&mut self, user_id: UserId, frame: Frame, message_id: i64) -> DeliveryOutcome {
        let Some(entry) = self.sessions.get(&user_id) else {
            return DeliveryOutcome::Offline;
        };

        // Only an owned `Removal` escapes this match, so the borrow of
        // `self.sessions` held by the reservation ends before the session is
        // removed.
        let removal = match entry.tx.try_reserve() {
            Ok(permit) => {
                if let Some(ledger) = &self.ledger {
                    match ledger.claim(message_id) {
                        Ok(true) => {}
                        Ok(false) => return DeliveryOutcome::AlreadyDelivered,
                        Err(e) => {
                            error!(message_id, user = %user_id, error = %e, "Could not mark message delivered");
                            return DeliveryOutcome::Offline;
                        }
                    }
                }

                permit.send(frame);
                return DeliveryOutcome::Enqueued;
            }
            Err(TrySendError::Full(())) => Removal::Overflow,
            Err(TrySendError::Closed(())) => Removal::Closed,
        };

        if matches!(removal, Removal::Overflow) {
            self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.remove_sessions(vec![(user_id, removal)]);
        DeliveryOutcome::Offline
    }

    /// Enqueue one frame for one user. Returns `false` if the frame did not
    /// make it onto a live queue.
    fn push(&mut self, user_id: UserId, frame: Frame) -> bool {
        let Some(entry) = self.sessions.get(&user_id) else {
            return false;
        };

        match entry.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.remove_sessions(vec![(user_id, Removal::Overflow)]);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.remove_sessions(vec![(user_id, Removal::Closed)]);
                false
            }
        }
    }

    /// Send `frame` to every session matching `filter`. Returns how many
    /// queues accepted it.
    fn fan_out(&mut self, frame: &Frame, filter: impl Fn(UserId, &SessionEntry) -> bool) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (uid, entry) in &self.sessions {
            if !filter(*uid, entry) {
                continue;
            }
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    failed.push((*uid, Removal::Overflow));
                }
                Err(TrySendError::Closed(_)) => failed.push((*uid, Removal::Closed)),
            }
        }

        if !failed.is_empty() {
            self.remove_sessions(failed);
        }

        debug!(kind = frame.kind(), delivered, "Fan-out complete");
        delivered
    }

    /// Remove sessions and tell everyone else. Notifying can itself
    /// overflow other queues, so removals are processed as a worklist.
    fn remove_sessions(&mut self, mut pending: Vec<(UserId, Removal)>) {
        while let Some((user_id, removal)) = pending.pop() {
            let Some(entry) = self.sessions.remove(&user_id) else {
                continue;
            };

            match removal {
                Removal::Overflow => {
                    self.metrics
                        .overflow_evictions
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        user = %user_id,
                        session = %entry.id,
                        capacity = self.capacity,
                        "Outbound queue full, evicting session"
                    );
                    self.emit(RegistryEvent::Evicted {
                        user_id,
                        session_id: entry.id,
                        reason: EvictReason::Overflow,
                    });
                }
                Removal::Disconnected | Removal::Closed => {
                    info!(
                        user = %user_id,
                        session = %entry.id,
                        online = self.sessions.len(),
                        "Session removed"
                    );
                    self.emit(RegistryEvent::Disconnected {
                        user_id,
                        session_id: entry.id,
                    });
                }
            }
            drop(entry);

            let notice = Frame::PeerDisconnect(PeerPresence { user_id });
            for (uid, other) in &self.sessions {
                match other.tx.try_send(notice.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        pending.push((*uid, Removal::Overflow));
                    }
                    Err(TrySendError::Closed(_)) => pending.push((*uid, Removal::Closed)),
                }
            }
        }
    }

    fn entry_mut(&mut self, user_id: UserId, session_id: Uuid) -> Option<&mut SessionEntry> {
        self.sessions
            .get_mut(&user_id)
            .filter(|entry| entry.id == session_id)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use skillswap_shared::protocol::{ChatFrame, ErrorFrame};

    use super::*;

    fn registry(capacity: usize) -> RegistryHandle {
        spawn_registry(
            RegistryConfig {
                queue_capacity: capacity,
            },
            None,
        )
    }

    fn chat(to: i64, body: &str, id: Option<i64>) -> Frame {
        Frame::Chat(ChatFrame {
            message_id: id,
            sender_id: UserId(99),
            receiver_id: UserId(to),
            content: body.to_string(),
            created_at: None,
        })
    }

    fn drain(session: &mut Session) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = session.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn second_connect_closes_first_queue() {
        let reg = registry(8);
        let mut first = reg.connect(UserId(1)).await.unwrap();
        let second = reg.connect(UserId(1)).await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(first.outbound.recv().await.is_none());
        assert!(reg.is_online(UserId(1)).await.unwrap());
        assert_eq!(reg.online_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_successor() {
        let reg = registry(8);
        let first = reg.connect(UserId(1)).await.unwrap();
        let second = reg.connect(UserId(1)).await.unwrap();

        reg.disconnect(UserId(1), first.id).await;
        assert!(reg.is_online(UserId(1)).await.unwrap());

        reg.disconnect(UserId(1), second.id).await;
        assert!(!reg.is_online(UserId(1)).await.unwrap());

        // Repeating is harmless.
        reg.disconnect(UserId(1), second.id).await;
        assert!(!reg.is_online(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn presence_frames_reach_others() {
        let reg = registry(8);
        let mut a = reg.connect(UserId(1)).await.unwrap();
        let b = reg.connect(UserId(2)).await.unwrap();

        reg.disconnect(UserId(2), b.id).await;
        reg.is_online(UserId(2)).await.unwrap();

        assert_eq!(
            drain(&mut a),
            vec![
                Frame::PeerConnect(PeerPresence { user_id: UserId(2) }),
                Frame::PeerDisconnect(PeerPresence { user_id: UserId(2) }),
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_except_skips_originator() {
        let reg = registry(8);
        let mut a = reg.connect(UserId(1)).await.unwrap();
        let mut b = reg.connect(UserId(2)).await.unwrap();
        let mut c = reg.connect(UserId(3)).await.unwrap();
        reg.is_online(UserId(1)).await.unwrap();
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        let frame = Frame::error("notice", "hello");
        reg.broadcast_except(UserId(1), frame.clone()).await;
        reg.is_online(UserId(1)).await.unwrap();

        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![frame.clone()]);
        assert_eq!(drain(&mut c), vec![frame]);
    }

    #[tokio::test]
    async fn resource_broadcast_only_reaches_joined() {
        let reg = registry(8);
        let mut a = reg.connect(UserId(1)).await.unwrap();
        let mut b = reg.connect(UserId(2)).await.unwrap();
        reg.join(UserId(1), a.id, ResourceId(10)).await;
        reg.join(UserId(2), b.id, ResourceId(11)).await;
        reg.is_online(UserId(1)).await.unwrap();
        drain(&mut a);
        drain(&mut b);

        let frame = Frame::error("swarm", "update");
        reg.broadcast_to_resource(ResourceId(10), frame.clone()).await;
        reg.leave(UserId(1), a.id, ResourceId(10)).await;
        reg.broadcast_to_resource(ResourceId(10), frame.clone()).await;
        reg.is_online(UserId(1)).await.unwrap();

        assert_eq!(drain(&mut a), vec![frame]);
        assert!(drain(&mut b).is_empty());

        let infos = reg.online_users().await.unwrap();
        assert_eq!(infos[1].joined_resources, vec![ResourceId(11)]);
    }

    #[tokio::test]
    async fn full_queue_evicts_session() {
        let reg = registry(2);
        let mut events = reg.subscribe();
        let mut slow = reg.connect(UserId(1)).await.unwrap();
        let mut fast = reg.connect(UserId(2)).await.unwrap();

        // `slow` already holds the peer_connect for user 2.
        reg.unicast(UserId(1), chat(1, "fits", None)).await;
        reg.unicast(UserId(1), chat(1, "overflows", None)).await;
        assert!(!reg.is_online(UserId(1)).await.unwrap());
        assert!(reg.is_online(UserId(2)).await.unwrap());

        assert_eq!(
            reg.counters(),
            RegistryCounters {
                frames_dropped: 1,
                overflow_evictions: 1,
            }
        );

        let mut saw_overflow = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::Evicted {
                user_id, reason, ..
            } = event
            {
                assert_eq!(user_id, UserId(1));
                saw_overflow |= reason == EvictReason::Overflow;
            }
        }
        assert!(saw_overflow);

        // The evicted queue keeps what fit, then closes.
        assert_eq!(drain(&mut slow).len(), 2);
        assert!(slow.outbound.recv().await.is_none());

        assert_eq!(
            drain(&mut fast),
            vec![Frame::PeerDisconnect(PeerPresence { user_id: UserId(1) })]
        );
    }

    /// Replays one marker frame at admission and treats ids up to
    /// `delivered_through` as already delivered.
    struct FixedLedger {
        delivered_through: i64,
        claimed: std::sync::Mutex<Vec<i64>>,
    }

    impl DeliveryLedger for FixedLedger {
        fn on_admit(&self, user_id: UserId, outbox: &mpsc::Sender<Frame>) {
            let _ = outbox.try_send(Frame::Error(ErrorFrame {
                code: "replayed".into(),
                message: user_id.to_string(),
            }));
        }

        fn claim(&self, message_id: i64) -> Result<bool, ServerError> {
            if message_id <= self.delivered_through {
                return Ok(false);
            }
            self.claimed.lock().unwrap().push(message_id);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn deliver_claims_through_ledger() {
        let ledger = Arc::new(FixedLedger {
            delivered_through: 5,
            claimed: std::sync::Mutex::new(Vec::new()),
        });
        let reg = spawn_registry(RegistryConfig { queue_capacity: 2 }, Some(ledger.clone()));

        assert_eq!(
            reg.deliver(UserId(1), chat(1, "early", Some(3)), 3)
                .await
                .unwrap(),
            DeliveryOutcome::Offline
        );

        let mut session = reg.connect(UserId(1)).await.unwrap();
        assert_eq!(
            reg.deliver(UserId(1), chat(1, "raced", Some(5)), 5)
                .await
                .unwrap(),
            DeliveryOutcome::AlreadyDelivered
        );
        assert_eq!(
            reg.deliver(UserId(1), chat(1, "live", Some(6)), 6)
                .await
                .unwrap(),
            DeliveryOutcome::Enqueued
        );

        // Queue is now full: the next message is neither sent nor claimed.
        assert_eq!(
            reg.deliver(UserId(1), chat(1, "spill", Some(7)), 7)
                .await
                .unwrap(),
            DeliveryOutcome::Offline
        );
        assert_eq!(*ledger.claimed.lock().unwrap(), vec![6]);

        let frames = drain(&mut session);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind(), "error");
        assert_eq!(frames[1], chat(1, "live", Some(6)));
        assert!(!reg.is_online(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let reg = registry(4);
        let mut session = reg.connect(UserId(1)).await.unwrap();
        reg.shutdown().await;

        assert!(session.outbound.recv().await.is_none());
        assert!(matches!(
            reg.is_online(UserId(1)).await,
            Err(RegistryError::Closed)
        ));
    }
}
