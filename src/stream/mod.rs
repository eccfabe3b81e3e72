//! # Stream Stages
//!
//! Explicit producer/consumer plumbing for chunk streams. Every stage runs as
//! a spawned producer writing into a bounded channel; the consumer side is a
//! [`ChannelStream`]. Backpressure comes from the channel bound, cancellation
//! from a [`CancelHandle`] shared by all stages of one request.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`StreamRecorder`] | Forwards a live stream while buffering it for the cache |
//! | [`StreamReplayer`] | Re-emits recorded chunks with live-like pacing |
//! | [`CancelHandle`] | Request-scoped cancellation signal |
//!
//! Dropping a [`ChannelStream`] stops its producer. A cancelled request stops
//! every stage spawned from its handle.

mod cancel;
mod recorder;
mod replayer;

pub use cancel::CancelHandle;
pub use recorder::StreamRecorder;
pub use replayer::{ReplayPacing, StreamReplayer, MAX_CHUNK_DELAY};

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Default channel bound between two stages.
pub const DEFAULT_STAGE_BUFFER: usize = 32;

/// Consumer half of a stage. Yields whatever the producer emits and ends when
/// the producer finishes.
pub struct ChannelStream<T> {
    rx: mpsc::Receiver<Result<T>>,
    token: CancellationToken,
}

impl<T> Stream for ChannelStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for ChannelStream<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Producer half of a stage.
pub(crate) struct Emitter<T> {
    tx: mpsc::Sender<Result<T>>,
    token: CancellationToken,
}

impl<T> Emitter<T> {
    /// Send one item. Returns `false` once the consumer is gone or the stage
    /// was cancelled; the producer should stop.
    pub(crate) async fn emit(&self, item: Result<T>) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    pub(crate) async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.token.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = self.tx.closed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Spawn `body` as the producer of a new stage whose token is a child of
/// `parent`.
pub(crate) fn spawn_stage<T, F, Fut>(parent: &CancelHandle, buffer: usize, body: F) -> ChannelStream<T>
where
    T: Send + 'static,
    F: FnOnce(Emitter<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let token = parent.child_token();
    let emitter = Emitter {
        tx,
        token: token.clone(),
    };
    tokio::spawn(body(emitter));
    ChannelStream { rx, token }
}
