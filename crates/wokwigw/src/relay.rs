//! Symmetric two-way frame pump.
//!
//! [`relay`] moves frames between two sides, each given as a `(source, sink)` pair, with one
//! task per direction. Whichever task hits a terminal condition first (orderly end of stream,
//! read error, write error) tears the whole connection down: the shared scope is cancelled,
//! which unblocks the other task, and each task closes the transports it owns on the way out.
//! `relay` resolves only once both tasks have released their slot of the completion barrier.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::RelayError;

/// Read capability of one side of a relay.
#[async_trait]
pub trait FrameSource: Send {
    /// Next whole frame; `Ok(None)` on orderly end of stream.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError>;
}

/// Write capability of one side of a relay.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), RelayError>;

    /// Release the underlying transport. Must tolerate being called after a failed `send`.
    async fn close(&mut self) {}
}

/// Cancellation scope and completion barrier shared by the two pump tasks.
#[derive(Debug)]
pub struct RelayScope {
    cancel: CancellationToken,
    torn_down: AtomicBool,
    teardowns: AtomicUsize,
    pending: AtomicUsize,
    first_error: Mutex<Option<RelayError>>,
}

impl RelayScope {
    pub fn new() -> Arc<Self> {
        Self::with_token(CancellationToken::new())
    }

    /// Scope that is also cancelled when `parent` is (e.g. process shutdown).
    pub fn child_of(parent: &CancellationToken) -> Arc<Self> {
        Self::with_token(parent.child_token())
    }

    fn with_token(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel,
            torn_down: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
            pending: AtomicUsize::new(2),
            first_error: Mutex::new(None),
        })
    }

    /// Run the shared teardown. Only the first caller has any effect; returns whether this call
    /// was it. The winning caller's `cause` becomes the relay's result.
    pub fn teardown(&self, cause: Option<RelayError>) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(err) = cause {
            if let Ok(mut slot) = self.first_error.lock() {
                *slot = Some(err);
            }
        }
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        self.cancel.cancel();
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// How many times the teardown body actually ran (0 or 1).
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }

    /// Tasks that have not yet released their barrier slot.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    fn take_error(&self) -> Option<RelayError> {
        self.first_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Releases the task's barrier slot even if the pump unwinds.
struct BarrierSlot(Arc<RelayScope>);

impl Drop for BarrierSlot {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.teardown(Some(RelayError::TaskPanicked));
        } else {
            self.0.teardown(None);
        }
        self.0.release();
    }
}

/// Pump frames both ways until either side ends, then tear down both.
pub async fn relay<SA, KA, SB, KB>(side_a: (SA, KA), side_b: (SB, KB)) -> Result<(), RelayError>
where
    SA: FrameSource + 'static,
    KA: FrameSink + 'static,
    SB: FrameSource + 'static,
    KB: FrameSink + 'static,
{
    relay_in_scope(RelayScope::new(), side_a, side_b).await
}

/// [`relay`] with a caller-provided scope, so the caller can observe or cancel it.
pub async fn relay_in_scope<SA, KA, SB, KB>(
    scope: Arc<RelayScope>,
    (a_source, a_sink): (SA, KA),
    (b_source, b_sink): (SB, KB),
) -> Result<(), RelayError>
where
    SA: FrameSource + 'static,
    KA: FrameSink + 'static,
    SB: FrameSource + 'static,
    KB: FrameSink + 'static,
{
    let span = tracing::Span::current();
    let a_to_b = tokio::spawn(pump("a->b", a_source, b_sink, scope.clone()).instrument(span.clone()));
    let b_to_a = tokio::spawn(pump("b->a", b_source, a_sink, scope.clone()).instrument(span));

    let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
    if a_to_b.is_err() || b_to_a.is_err() {
        // Normally recorded by the unwinding task itself; covers tasks aborted by the runtime.
        scope.teardown(Some(RelayError::TaskPanicked));
    }

    match scope.take_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn pump<S, K>(direction: &'static str, mut source: S, mut sink: K, scope: Arc<RelayScope>)
where
    S: FrameSource,
    K: FrameSink,
{
    let slot = BarrierSlot(scope.clone());

    let cause = tokio::select! {
        biased;
        _ = scope.cancel.cancelled() => None,
        res = forward(&mut source, &mut sink) => res.err(),
    };
    match &cause {
        Some(err) => tracing::debug!(direction, "relay direction failed: {err}"),
        None => tracing::trace!(direction, "relay direction finished"),
    }
    scope.teardown(cause);

    sink.close().await;
    drop(source);
    drop(slot);
}

async fn forward<S, K>(source: &mut S, sink: &mut K) -> Result<(), RelayError>
where
    S: FrameSource,
    K: FrameSink,
{
    while let Some(frame) = source.recv().await? {
        sink.send(frame).await?;
    }
    Ok(())
}
