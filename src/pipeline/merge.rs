//! Single ordered outbound channel.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use super::tools::AnnotationReceiver;
use crate::stream::{spawn_stage, CancelHandle, ChannelStream, DEFAULT_STAGE_BUFFER};
use crate::types::{Annotation, StreamChunk, StreamPart};
use crate::BoxStream;

/// Work that must be issued before the client sees `finish`.
#[async_trait]
pub trait FinishHook: Send + 'static {
    /// Called once with every chunk of a cleanly finished response, the
    /// `finish` chunk included. Returned annotations are emitted ahead of
    /// `finish`.
    async fn on_finish(self: Box<Self>, transcript: &[StreamChunk]) -> Vec<Annotation>;
}

/// Interleaves chunks and side-channel annotations into one stream.
///
/// Chunks keep their input order. Annotations are emitted as soon as they
/// are available, ahead of pending chunks. The `finish` chunk is held until
/// the input ends: then remaining annotations are flushed, the finish hook
/// runs and its annotations go out, and `finish` comes last. A response that
/// fails, is cancelled, or never finishes does not run the hook.
#[derive(Default)]
pub struct StreamMerger {
    hook: Option<Box<dyn FinishHook>>,
}

impl StreamMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finish_hook(mut self, hook: Box<dyn FinishHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn merge(
        self,
        mut input: BoxStream<'static, StreamChunk>,
        mut annotations: AnnotationReceiver,
        cancel: &CancelHandle,
    ) -> ChannelStream<StreamPart> {
        let hook = self.hook;
        spawn_stage(cancel, DEFAULT_STAGE_BUFFER, move |out| async move {
            let mut transcript: Vec<StreamChunk> = Vec::new();
            let mut finish: Option<StreamChunk> = None;
            let mut side_open = true;
            loop {
                tokio::select! {
                    biased;
                    _ = out.cancelled() => {
                        debug!(chunks = transcript.len(), "merge cancelled");
                        return;
                    }
                    note = annotations.recv(), if side_open => match note {
                        Some(a) => {
                            if !out.emit(Ok(StreamPart::Annotation(a))).await {
                                return;
                            }
                        }
                        None => side_open = false,
                    },
                    next = input.next() => match next {
                        Some(Ok(chunk)) if chunk.is_finish() => finish = Some(chunk),
                        Some(Ok(chunk)) => {
                            transcript.push(chunk.clone());
                            if !out.emit(Ok(StreamPart::Chunk(chunk))).await {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            out.emit(Err(e)).await;
                            return;
                        }
                        None => break,
                    },
                }
            }

            let Some(finish) = finish else {
                debug!(chunks = transcript.len(), "input ended without finish");
                return;
            };
            while let Ok(a) = annotations.try_recv() {
                if !out.emit(Ok(StreamPart::Annotation(a))).await {
                    return;
                }
            }
            if out.is_cancelled() {
                return;
            }
            transcript.push(finish.clone());
            if let Some(hook) = hook {
                for a in hook.on_finish(&transcript).await {
                    if !out.emit(Ok(StreamPart::Annotation(a))).await {
                        return;
                    }
                }
            }
            out.emit(Ok(StreamPart::Chunk(finish))).await;
        })
    }
}
