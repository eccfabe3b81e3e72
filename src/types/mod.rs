//! # Types Module
//!
//! Core data model shared by the cache, the stream stages and the drivers.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`GenerationRequest`] | Everything that determines model output |
//! | [`GenerateResult`] | Result of a single-shot generation |
//! | [`StreamChunk`] | One ordered unit of a streamed generation |
//! | [`StreamPart`] | Outbound element: chunk or [`Annotation`] |
//! | [`Message`] | Prompt message with role and content |
//! | [`StoredMessage`] | Durable message row |
//! | [`ToolDefinition`] / [`ToolCall`] | Tool calling |

pub mod events;
pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use events::{
    Annotation, ChunkEvent, ChunkKind, ChunkSequencer, ResponseMetadata, StreamChunk, StreamPart,
    Usage,
};
pub use message::{Attachment, ContentBlock, Message, MessageContent, MessageRole, StoredMessage};
pub use request::GenerationRequest;
pub use response::GenerateResult;
pub use tool::{ToolCall, ToolChoice, ToolDefinition};
