//! Persisted direct messages and their delivery to live sessions.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use skillswap_shared::protocol::{ChatFrame, FileFrame};
use skillswap_shared::{Frame, UserId};
use skillswap_store::{ChatMessage, ChatPayload};

use crate::db::{with_db, SharedDb};
use crate::error::ServerError;
use crate::registry::{DeliveryLedger, DeliveryOutcome, RegistryError, RegistryHandle};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 500;

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[derive(Clone)]
pub struct MessageDelivery {
    db: SharedDb,
    registry: RegistryHandle,
}

impl MessageDelivery {
    pub fn new(db: SharedDb, registry: RegistryHandle) -> Self {
        Self { db, registry }
    }

    /// Persist a message and push it to the receiver if they are online.
    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        payload: ChatPayload,
    ) -> Result<ChatMessage, ServerError> {
        validate(sender_id, receiver_id, &payload)?;

        let mut message = with_db(&self.db, |db| {
            db.insert_message(sender_id, receiver_id, &payload, Utc::now())
        })?;

        let outcome = self
            .registry
            .deliver(receiver_id, message_frame(&message), message.id)
            .await?;

        // The registry flips the row to delivered before it answers.
        match outcome {
            DeliveryOutcome::Enqueued | DeliveryOutcome::AlreadyDelivered => {
                message.delivered = true;
            }
            DeliveryOutcome::Offline => {
                debug!(
                    message_id = message.id,
                    receiver = %receiver_id,
                    "Receiver offline, message kept for replay"
                );
            }
        }

        Ok(message)
    }

    /// Conversation between two users, oldest first.
    pub fn history(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: Option<u32>,
    ) -> Result<Vec<ChatMessage>, ServerError> {
        if !user_a.is_valid() || !user_b.is_valid() {
            return Err(ServerError::Validation("both user ids are required".into()));
        }
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        with_db(&self.db, |db| db.conversation(user_a, user_b, limit))
    }
}

fn validate(sender_id: UserId, receiver_id: UserId, payload: &ChatPayload) -> Result<(), ServerError> {
    if !sender_id.is_valid() {
        return Err(ServerError::Validation("sender_id is required".into()));
    }
    if !receiver_id.is_valid() {
        return Err(ServerError::Validation("receiver_id is required".into()));
    }
    if sender_id == receiver_id {
        return Err(ServerError::Validation(
            "cannot send a message to yourself".into(),
        ));
    }
    if let ChatPayload::Text(text) = payload {
        if text.trim().is_empty() {
            return Err(ServerError::Validation("message content is empty".into()));
        }
    }
    Ok(())
}

/// The frame a stored message travels as.
pub fn message_frame(message: &ChatMessage) -> Frame {
    match &message.payload {
        ChatPayload::Text(content) => Frame::Chat(ChatFrame {
            message_id: Some(message.id),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: content.clone(),
            created_at: Some(message.created_at),
        }),
        ChatPayload::File(file_id) => Frame::File(FileFrame {
            message_id: Some(message.id),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            file_id: *file_id,
            created_at: Some(message.created_at),
        }),
    }
}

/// Result of one admission replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub replayed: usize,
    /// Left undelivered because the queue filled up.
    pub remaining: usize,
}

/// Replays undelivered messages onto a session queue at admission.
pub struct PendingReplay {
    db: SharedDb,
}

impl PendingReplay {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Enqueue every undelivered message for `user_id`, oldest first.
    ///
    /// Queue slots are reserved first and the rows are marked delivered
    /// before anything is sent, so a failed update leaves the queue untouched.
    pub fn flush_pending(
        &self,
        user_id: UserId,
        outbox: &mpsc::Sender<Frame>,
    ) -> Result<FlushReport, ServerError> {
        with_db(&self.db, |db| {
            let pending = db.pending_messages(user_id)?;
            if pending.is_empty() {
                return Ok(FlushReport::default());
            }

            let mut slots = Vec::with_capacity(pending.len());
            for message in &pending {
                match outbox.try_reserve() {
                    Ok(permit) => slots.push((permit, message)),
                    Err(_) => break,
                }
            }

            let ids: Vec<i64> = slots.iter().map(|(_, message)| message.id).collect();
            db.mark_delivered(&ids)?;

            let replayed = slots.len();
            for (permit, message) in slots {
                permit.send(message_frame(message));
            }

            Ok(FlushReport {
                replayed,
                remaining: pending.len() - replayed,
            })
        })
    }
}

impl DeliveryLedger for PendingReplay {
    fn on_admit(&self, user_id: UserId, outbox: &mpsc::Sender<Frame>) {
        match self.flush_pending(user_id, outbox) {
            Ok(report) => {
                if report.remaining > 0 {
                    warn!(
                        user = %user_id,
                        replayed = report.replayed,
                        remaining = report.remaining,
                        "Queue filled during replay, rest kept for next connect"
                    );
                } else if report.replayed > 0 {
                    info!(user = %user_id, replayed = report.replayed, "Replayed pending messages");
                }
            }
            Err(e) => {
                error!(user = %user_id, error = %e, "Pending message replay failed");
            }
        }
    }

    fn claim(&self, message_id: i64) -> Result<bool, ServerError> {
        let marked = with_db(&self.db, |db| db.mark_delivered(&[message_id]))?;
        Ok(marked == 1)
    }
}
