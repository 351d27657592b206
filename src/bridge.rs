//! Push-to-pull bridge for callback-driven query producers.
//!
//! Query executors deliver results by calling back on their own thread or
//! task. [`PullBridge`] turns those callbacks into a cancellable sequence
//! the consumer pulls from one value at a time.
//!
//! The handoff is a strict one-slot rendezvous. A call to
//! [`PullBridge::next`] creates a fresh single-use slot and hands it to the
//! producer before waiting on it. The producer can only deliver into a slot
//! it has taken, so at most one value is ever in flight and values arrive in
//! exactly the order they were emitted, whatever the relative speed of the
//! two sides. If a `next` future is dropped while waiting, its slot stays
//! with the bridge and the following call reads it instead of creating a
//! new one.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_stream::stream;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BoxError, Error, Result};
use crate::sequence::PullSequence;

/// One notification from a producer.
#[derive(Debug)]
pub enum Delivery<T> {
    /// The next record, in emission order.
    Record(T),
    /// The query failed. No further notifications follow.
    Error(BoxError),
    /// The query finished. No further notifications follow.
    Complete,
}

type Slot<T> = oneshot::Sender<Delivery<T>>;

/// An external query executor that pushes results through callbacks.
///
/// The bridge owns the producer for its whole lifetime.
pub trait Producer<T>: Send + 'static {
    /// Begin running the query and deliver results into `sink`.
    ///
    /// Called at most once, on the first pull. Must return promptly: results
    /// are delivered from the producer's own thread or task, never from
    /// inside this call.
    fn start(&mut self, sink: RecordSink<T>);

    /// Ask a started producer to stop. Best effort; values already in
    /// transit may still be delivered.
    fn stop(&mut self) {}

    /// Release the connection or session behind the query. Called exactly
    /// once per bridge.
    fn release(&mut self) {}
}

/// Producer-side handle used to deliver notifications to a [`PullBridge`].
///
/// Every delivery waits until the consumer asks for the next value. The
/// `blocking_*` variants are for producers that call back on plain OS
/// threads; do not call them from inside an async runtime.
pub struct RecordSink<T> {
    ready: mpsc::Receiver<Slot<T>>,
    cancel: CancellationToken,
    finished: bool,
}

impl<T> RecordSink<T> {
    /// Deliver the next record.
    ///
    /// Returns [`Error::Cancelled`] once the consumer has cancelled, closed
    /// or dropped the bridge; the producer should stop emitting.
    pub async fn emit(&mut self, value: T) -> Result<()> {
        self.deliver(Delivery::Record(value)).await
    }

    /// Report that the query failed.
    pub async fn fail(mut self, cause: impl Into<BoxError>) -> Result<()> {
        self.deliver(Delivery::Error(cause.into())).await
    }

    /// Report that the query finished.
    pub async fn complete(mut self) -> Result<()> {
        self.deliver(Delivery::Complete).await
    }

    /// Deliver an arbitrary notification.
    pub async fn deliver(&mut self, delivery: Delivery<T>) -> Result<()> {
        if !matches!(delivery, Delivery::Record(_)) {
            self.finished = true;
        }

        let slot = self.take_slot().await?;
        // The bridge holds on to the receiving end until it has read the
        // slot, so a closed slot means the bridge itself is gone.
        slot.send(delivery).map_err(|_| Error::Cancelled)
    }

    /// Blocking version of [`emit`](Self::emit).
    pub fn blocking_emit(&mut self, value: T) -> Result<()> {
        futures::executor::block_on(self.emit(value))
    }

    /// Blocking version of [`fail`](Self::fail).
    pub fn blocking_fail(self, cause: impl Into<BoxError>) -> Result<()> {
        futures::executor::block_on(self.fail(cause))
    }

    /// Blocking version of [`complete`](Self::complete).
    pub fn blocking_complete(self) -> Result<()> {
        futures::executor::block_on(self.complete())
    }

    /// Returns true once the consumer has cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the consumer cancels, for producers that want
    /// to abort work between deliveries.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn take_slot(&mut self) -> Result<Slot<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            slot = self.ready.recv() => slot.ok_or(Error::Cancelled),
        }
    }
}

impl<T> Drop for RecordSink<T> {
    fn drop(&mut self) {
        if !self.finished && !self.cancel.is_cancelled() {
            warn!("Producer dropped its sink without completing");
        }
    }
}

struct ProducerState<T> {
    producer: Option<Box<dyn Producer<T>>>,
    started: bool,
}

/// State shared between the bridge and its cancel handles.
struct Shared<T> {
    state: Mutex<ProducerState<T>>,
    cancel: CancellationToken,
}

impl<T: 'static> Shared<T> {
    /// Start the producer unless it was already started or torn down.
    fn start(&self, sink: RecordSink<T>) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        if state.started {
            return;
        }
        if let Some(producer) = state.producer.as_mut() {
            debug!("Starting query producer");
            state.started = true;
            producer.start(sink);
        }
    }

    /// Release the producer, stopping it first when `interrupt` is set and
    /// it was started. Only the first call does anything.
    fn teardown(&self, reason: &'static str, interrupt: bool) {
        let (producer, started) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (state.producer.take(), state.started)
        };

        if let Some(mut producer) = producer {
            debug!(reason, started, interrupt, "Releasing query producer");
            if interrupt && started {
                producer.stop();
            }
            producer.release();
        }
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

impl<T: 'static> Cancel for Shared<T> {
    fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Query cancelled");
            self.cancel.cancel();
        }
        self.teardown("cancelled", true);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Cloneable handle that cancels a [`PullBridge`] from any thread or task.
///
/// Cancelling wakes a suspended [`PullBridge::next`] with
/// [`Error::Cancelled`] and releases the producer right away, without
/// waiting for another pull.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<dyn Cancel>,
}

impl CancelHandle {
    /// Cancel the bridge. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BridgeState {
    Running,
    Finished,
    Cancelled,
}

enum Outcome<T> {
    Delivered(Delivery<T>),
    Cancelled,
    ProducerGone,
}

/// Pull-based view over a callback-driven [`Producer`].
///
/// # Example
///
/// ```ignore
/// use hids_stream::PullBridge;
///
/// let mut bridge = PullBridge::new(producer);
/// while let Some(value) = bridge.next().await? {
///     process(value);
/// }
/// ```
pub struct PullBridge<T: 'static> {
    shared: Arc<Shared<T>>,
    ready: mpsc::Sender<Slot<T>>,
    /// Receiving end of the slot the producer was last given. Kept across
    /// calls until it resolves, so an abandoned `next` loses nothing.
    pending: Option<oneshot::Receiver<Delivery<T>>>,
    sink: Option<RecordSink<T>>,
    state: BridgeState,
}

impl<T: Send + 'static> PullBridge<T> {
    /// Create a bridge over `producer`. The producer is not started until
    /// the first pull.
    pub fn new(producer: impl Producer<T>) -> Self {
        Self::from_boxed(Box::new(producer))
    }

    /// Create a bridge over an already boxed producer.
    pub fn from_boxed(producer: Box<dyn Producer<T>>) -> Self {
        let cancel = CancellationToken::new();
        // Capacity 1: only the slot of the pending pull can be waiting.
        let (ready, ready_rx) = mpsc::channel(1);

        let sink = RecordSink {
            ready: ready_rx,
            cancel: cancel.clone(),
            finished: false,
        };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProducerState {
                    producer: Some(producer),
                    started: false,
                }),
                cancel,
            }),
            ready,
            pending: None,
            sink: Some(sink),
            state: BridgeState::Running,
        }
    }

    /// Start the producer. Later calls, and calls after teardown, do nothing.
    pub fn start(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.shared.start(sink);
        }
    }

    /// Wait for the next value.
    ///
    /// Returns:
    /// - `Ok(Some(value))` - The next value the producer emitted
    /// - `Ok(None)` - The query completed, or failed on an earlier call
    /// - `Err(Error::Upstream(_))` - The producer failed during this call
    /// - `Err(Error::Cancelled)` - The bridge was cancelled; repeated on every later call
    pub async fn next(&mut self) -> Result<Option<T>> {
        match self.state {
            BridgeState::Finished => return Ok(None),
            BridgeState::Cancelled => return Err(Error::Cancelled),
            BridgeState::Running => {}
        }

        if self.shared.cancel.is_cancelled() {
            return Err(self.cancelled());
        }

        self.start();

        match self.rendezvous().await {
            Outcome::Delivered(Delivery::Record(value)) => {
                trace!("Record handed to consumer");
                Ok(Some(value))
            }
            Outcome::Delivered(Delivery::Error(cause)) => {
                debug!(error = %cause, "Producer reported an error");
                self.finish("failed");
                Err(Error::Upstream(cause))
            }
            Outcome::Delivered(Delivery::Complete) => {
                self.finish("completed");
                Ok(None)
            }
            Outcome::Cancelled => Err(self.cancelled()),
            Outcome::ProducerGone => {
                self.finish("producer gone");
                Err(Error::upstream(
                    "producer stopped without signalling completion",
                ))
            }
        }
    }

    async fn rendezvous(&mut self) -> Outcome<T> {
        let cancel = self.shared.cancel.clone();

        loop {
            if self.pending.is_none() {
                let (slot, delivery) = oneshot::channel();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Outcome::Cancelled,
                    sent = self.ready.send(slot) => {
                        if sent.is_err() {
                            return Outcome::ProducerGone;
                        }
                    }
                }
                self.pending = Some(delivery);
            }
            let Some(delivery) = self.pending.as_mut() else {
                return Outcome::ProducerGone;
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                received = delivery => received,
            };
            self.pending = None;

            match received {
                Ok(delivery) => return Outcome::Delivered(delivery),
                Err(_) if self.ready.is_closed() => return Outcome::ProducerGone,
                // The producer dropped this slot without using it.
                Err(_) => continue,
            }
        }
    }

    fn finish(&mut self, reason: &'static str) {
        self.state = BridgeState::Finished;
        self.pending = None;
        self.sink = None;
        self.shared.teardown(reason, false);
    }

    fn cancelled(&mut self) -> Error {
        self.state = BridgeState::Cancelled;
        self.pending = None;
        self.sink = None;
        self.shared.teardown("cancelled", true);
        Error::Cancelled
    }

    /// Cancel the bridge and release the producer. Idempotent.
    ///
    /// Has no effect on a bridge that already completed or failed, other
    /// than making sure the producer is released.
    pub fn cancel(&mut self) {
        if self.state == BridgeState::Running {
            self.state = BridgeState::Cancelled;
            self.shared.cancel();
            self.pending = None;
            self.sink = None;
        } else {
            self.shared.teardown("closed", false);
        }
    }

    /// Same as [`cancel`](Self::cancel).
    pub fn close(&mut self) {
        self.cancel();
    }

    /// Handle for cancelling this bridge from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Returns true once the bridge completed, failed or was cancelled.
    pub fn is_terminated(&self) -> bool {
        self.state != BridgeState::Running || self.shared.cancel.is_cancelled()
    }

    /// Convert the bridge into a [`Stream`] of values.
    ///
    /// The stream ends after the first error.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>> {
        let mut bridge = self;
        let s = stream! {
            loop {
                match bridge.next().await {
                    Ok(Some(value)) => yield Ok(value),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };

        Box::pin(s)
    }
}

impl<T: 'static> Drop for PullBridge<T> {
    fn drop(&mut self) {
        let running = self.state == BridgeState::Running;
        if running {
            self.shared.cancel.cancel();
        }
        self.shared.teardown("dropped", running);
    }
}

impl<T: Send + 'static> PullSequence for PullBridge<T> {
    type Item = T;

    async fn next(&mut self) -> Result<Option<T>> {
        PullBridge::next(self).await
    }

    fn close(&mut self) {
        PullBridge::close(self);
    }
}
