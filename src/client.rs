//! Chat orchestration.
//!
//! The public surface is small: build a [`ChatOrchestrator`], hand it
//! [`ChatRequest`]s, read each [`ChatResponse`] stream, and call
//! `shutdown` before the process exits.

pub mod builder;
pub mod chat;
pub mod core;

pub use builder::ChatOrchestratorBuilder;
pub use chat::{ChatRequest, ChatResponse};
pub use core::ChatOrchestrator;
