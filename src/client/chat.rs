use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationLabel;
use crate::routing::Route;
use crate::stream::CancelHandle;
use crate::types::{Attachment, ContentBlock, Message, MessageContent, MessageRole, StreamPart};
use crate::{BoxStream, Result};

/// One inbound chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub chat_id: String,
    /// Conversation so far, ending with the new user message.
    pub messages: Vec<Message>,
    /// Files attached to the new user message.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub system: Option<String>,
    /// Overrides the configured model.
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(chat_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            chat_id: chat_id.into(),
            messages,
            attachments: Vec::new(),
            system: None,
            model: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == MessageRole::User)
    }

    /// Messages as sent to the model: attachments are appended to the last
    /// user message as content blocks.
    pub fn prompt_messages(&self) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if self.attachments.is_empty() {
            return messages;
        }
        if let Some(last) = messages.iter_mut().rev().find(|m| m.role == MessageRole::User) {
            let mut blocks = match std::mem::replace(&mut last.content, MessageContent::Blocks(Vec::new())) {
                MessageContent::Text(t) => vec![ContentBlock::text(t)],
                MessageContent::Blocks(b) => b,
            };
            blocks.extend(self.attachments.iter().map(Attachment::to_block));
            last.content = MessageContent::Blocks(blocks);
        }
        messages
    }
}

/// Outbound side of a handled request.
pub struct ChatResponse {
    pub label: ClassificationLabel,
    pub route: Route,
    pub stream: BoxStream<'static, StreamPart>,
    pub(crate) cancel: CancelHandle,
}

impl ChatResponse {
    /// Stop every stage of this request. Nothing is cached or persisted for
    /// a cancelled response.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<StreamPart>> {
        let mut parts = Vec::new();
        while let Some(part) = self.stream.next().await {
            parts.push(part?);
        }
        Ok(parts)
    }
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatResponse")
            .field("label", &self.label)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}
