//! Durable message writes.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::accumulate::{ResponseAccumulator, ResponseTurn};
use super::merge::FinishHook;
use super::sanitize::sanitize_turns;
use crate::types::{
    Annotation, Attachment, ContentBlock, Message, MessageContent, MessageRole, StoredMessage, StreamChunk,
};
use crate::Result;

/// Storage collaborator for message rows. Writes are opaque inserts.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_messages(&self, messages: &[StoredMessage]) -> Result<()>;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Keeps rows in memory. Used by tests and the offline CLI.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn messages_for(&self, chat_id: &str) -> Vec<StoredMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_messages(&self, messages: &[StoredMessage]) -> Result<()> {
        if let Ok(mut rows) = self.rows.lock() {
            rows.extend_from_slice(messages);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Sanitizes and writes the turns of one finished request.
///
/// Every role turn gets a fresh message id; ids are unrelated to cache keys,
/// so one cached generation replayed into several chats yields distinct
/// rows. Writes run in the background and failures are only logged.
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn MessageStore>,
    pending: TaskTracker,
    draining: Arc<tokio::sync::Mutex<()>>,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            pending: TaskTracker::new(),
            draining: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Build rows for the given turns, sanitizing first. Empty turns produce
    /// no row.
    pub fn prepare(&self, chat_id: &str, turns: Vec<ResponseTurn>, attachments: &[Attachment]) -> Vec<StoredMessage> {
        let created_at = Utc::now();
        sanitize_turns(turns)
            .into_iter()
            .map(|turn| StoredMessage {
                id: Uuid::new_v4(),
                chat_id: chat_id.to_string(),
                attachments: if turn.role == MessageRole::User && !attachments.is_empty() {
                    Some(attachments.to_vec())
                } else {
                    None
                },
                role: turn.role,
                content: turn.content,
                created_at,
            })
            .collect()
    }

    /// Issue the write and return immediately.
    pub fn persist(&self, rows: Vec<StoredMessage>) {
        if rows.is_empty() {
            return;
        }
        let store = self.store.clone();
        self.pending.spawn(async move {
            match store.save_messages(&rows).await {
                Ok(()) => debug!(rows = rows.len(), store = store.name(), "messages persisted"),
                Err(e) => warn!(rows = rows.len(), store = store.name(), error = %e, "failed to persist messages"),
            }
        });
    }

    /// Wait for every write issued so far. Concurrent callers drain one at a
    /// time.
    pub async fn drain(&self) {
        let _guard = self.draining.lock().await;
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    /// Finish hook persisting `user` and the generated turns of one request.
    pub fn on_finish(&self, chat_id: impl Into<String>, user: Option<Message>, attachments: Vec<Attachment>) -> PersistOnFinish {
        PersistOnFinish {
            sink: self.clone(),
            chat_id: chat_id.into(),
            user,
            attachments,
        }
    }
}

fn message_blocks(message: Message) -> Vec<ContentBlock> {
    match message.content {
        MessageContent::Text(t) => vec![ContentBlock::text(t)],
        MessageContent::Blocks(b) => b,
    }
}

/// [`FinishHook`] writing the user turn and the response turns once the
/// response finished.
pub struct PersistOnFinish {
    sink: PersistenceSink,
    chat_id: String,
    user: Option<Message>,
    attachments: Vec<Attachment>,
}

#[async_trait]
impl FinishHook for PersistOnFinish {
    async fn on_finish(self: Box<Self>, transcript: &[StreamChunk]) -> Vec<Annotation> {
        let PersistOnFinish {
            sink,
            chat_id,
            user,
            attachments,
        } = *self;
        let mut turns: Vec<ResponseTurn> = Vec::new();
        if let Some(user) = user {
            turns.push(ResponseTurn::new(user.role, message_blocks(user)));
        }
        turns.extend(ResponseAccumulator::from_chunks(transcript).into_turns());

        let rows = sink.prepare(&chat_id, turns, &attachments);
        let ids = rows
            .iter()
            .map(|r| Annotation::MessageId {
                message_id: r.id,
                role: r.role,
            })
            .collect();
        sink.persist(rows);
        ids
    }
}
