use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::Message,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{error::SyncError, reconciler::MessageReconciler};

const PLACEHOLDER_PREFIX: &str = "local-";

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        credential: &str,
        room_id: &RoomId,
        content: &str,
    ) -> Result<Message, SyncError>;
}

/// Bookkeeping for sends that have a placeholder on screen but no server
/// answer yet. Each placeholder settles exactly once.
#[derive(Debug, Default)]
pub struct OptimisticSendTracker {
    outstanding: HashSet<MessageId>,
}

impl OptimisticSendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(
        &mut self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &str,
    ) -> Result<Message, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".into()));
        }

        let placeholder_id = MessageId::new(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()));
        self.outstanding.insert(placeholder_id.clone());

        Ok(Message {
            id: placeholder_id,
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            pending: true,
        })
    }

    /// Returns `false` if the send was already settled or abandoned.
    pub fn confirm(
        &mut self,
        reconciler: &mut MessageReconciler,
        placeholder_id: &MessageId,
        confirmed: Message,
    ) -> bool {
        if !self.outstanding.remove(placeholder_id) {
            return false;
        }
        reconciler.supersede(placeholder_id, confirmed);
        true
    }

    pub fn fail(&mut self, reconciler: &mut MessageReconciler, placeholder_id: &MessageId) -> bool {
        if !self.outstanding.remove(placeholder_id) {
            return false;
        }
        reconciler.discard_placeholder(placeholder_id);
        true
    }

    /// Removes every unsettled placeholder. Sends still in flight will find
    /// nothing to settle.
    pub fn abandon_all(&mut self, reconciler: &mut MessageReconciler) -> usize {
        let abandoned = self.outstanding.len();
        for placeholder_id in self.outstanding.drain() {
            reconciler.discard_placeholder(&placeholder_id);
        }
        abandoned
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, placeholder_id: &MessageId) -> bool {
        self.outstanding.contains(placeholder_id)
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

/// Returned by [`crate::RoomSync::send`] once the placeholder is visible.
pub struct SendHandle {
    placeholder_id: MessageId,
    task: JoinHandle<Result<Message, SyncError>>,
}

impl SendHandle {
    pub(crate) fn new(
        placeholder_id: MessageId,
        task: JoinHandle<Result<Message, SyncError>>,
    ) -> Self {
        Self {
            placeholder_id,
            task,
        }
    }

    pub fn placeholder_id(&self) -> &MessageId {
        &self.placeholder_id
    }

    /// Waits for the send to settle. The placeholder has already been
    /// superseded or removed when this resolves.
    pub async fn settled(self) -> Result<Message, SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::Transient(format!("send task aborted: {err}"))),
        }
    }
}
