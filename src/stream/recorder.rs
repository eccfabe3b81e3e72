use futures::StreamExt;
use tracing::debug;

use super::{spawn_stage, CancelHandle, ChannelStream, DEFAULT_STAGE_BUFFER};
use crate::types::StreamChunk;
use crate::BoxStream;

/// Tees a live stream: every chunk is forwarded as soon as it arrives and
/// appended to an in-memory buffer.
///
/// `on_complete` runs exactly once, with the full buffer, when the upstream
/// ends cleanly after a `finish` chunk. It runs before the output stream
/// ends, so any task it spawns is already registered when the consumer sees
/// end-of-stream. Upstream errors are forwarded and the buffer discarded, as
/// is the buffer of a cancelled or abandoned stream.
#[derive(Debug, Clone)]
pub struct StreamRecorder {
    buffer: usize,
}

impl Default for StreamRecorder {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_STAGE_BUFFER,
        }
    }
}

impl StreamRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn wrap<F>(
        &self,
        mut live: BoxStream<'static, StreamChunk>,
        cancel: &CancelHandle,
        on_complete: F,
    ) -> ChannelStream<StreamChunk>
    where
        F: FnOnce(Vec<StreamChunk>) + Send + 'static,
    {
        spawn_stage(cancel, self.buffer, move |out| async move {
            let mut recorded: Vec<StreamChunk> = Vec::new();
            let mut finished = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = out.cancelled() => break,
                    next = live.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        finished |= chunk.is_finish();
                        recorded.push(chunk.clone());
                        if !out.emit(Ok(chunk)).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(recorded = recorded.len(), error = %e, "live stream failed, recording discarded");
                        out.emit(Err(e)).await;
                        return;
                    }
                    None if finished => {
                        debug!(chunks = recorded.len(), "live stream complete");
                        on_complete(recorded);
                        return;
                    }
                    None => {
                        debug!(recorded = recorded.len(), "live stream ended without finish, not recorded");
                        return;
                    }
                }
            }
            debug!(recorded = recorded.len(), "recording abandoned");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkEvent, ChunkSequencer};
    use crate::Error;
    use futures::stream;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn live(events: Vec<crate::Result<ChunkEvent>>) -> BoxStream<'static, StreamChunk> {
        let mut seq = ChunkSequencer::new();
        let items: Vec<_> = events
            .into_iter()
            .map(|e| e.map(|ev| seq.chunk(ev)))
            .collect();
        Box::pin(stream::iter(items))
    }

    type Sink = Arc<Mutex<Vec<Vec<StreamChunk>>>>;

    fn sink() -> (Sink, impl FnOnce(Vec<StreamChunk>) + Send + 'static) {
        let s: Sink = Arc::default();
        let s2 = s.clone();
        (s, move |chunks| s2.lock().unwrap().push(chunks))
    }

    #[tokio::test]
    async fn test_forwards_and_records_complete_stream() {
        let (recorded, on_complete) = sink();
        let out = StreamRecorder::new().wrap(
            live(vec![
                Ok(ChunkEvent::text("a")),
                Ok(ChunkEvent::text("b")),
                Ok(ChunkEvent::finish("stop", None)),
            ]),
            &CancelHandle::new(),
            on_complete,
        );
        let forwarded: Vec<_> = out.map(|r| r.unwrap()).collect().await;
        assert_eq!(forwarded.len(), 3);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], forwarded);
    }

    #[tokio::test]
    async fn test_error_is_forwarded_and_nothing_recorded() {
        let (recorded, on_complete) = sink();
        let out = StreamRecorder::new().wrap(
            live(vec![
                Ok(ChunkEvent::text("a")),
                Err(Error::runtime("upstream reset")),
            ]),
            &CancelHandle::new(),
            on_complete,
        );
        let items: Vec<_> = out.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_without_finish_is_not_recorded() {
        let (recorded, on_complete) = sink();
        let out = StreamRecorder::new().wrap(
            live(vec![Ok(ChunkEvent::text("a"))]),
            &CancelHandle::new(),
            on_complete,
        );
        let _: Vec<_> = out.collect().await;
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_recording_is_discarded() {
        let (recorded, on_complete) = sink();
        let cancel = CancelHandle::new();
        let first = live(vec![Ok(ChunkEvent::text("a"))]);
        let never: BoxStream<'static, StreamChunk> = Box::pin(stream::pending::<crate::Result<StreamChunk>>());
        let mut out = StreamRecorder::new().wrap(Box::pin(first.chain(never)), &cancel, on_complete);

        assert!(out.next().await.unwrap().is_ok());
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), out.next())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(recorded.lock().unwrap().is_empty());
    }
}
