//! Dynamically extensible sequence of invocations.
//!
//! The iterator is split in two halves. [`InvocationIterator`] is owned by the
//! single consumer and yields units one by one. [`IteratorHandle`] is cheap to
//! clone and is given to the producer and to every completion callback so
//! retries can re-enter the sequence while it is being consumed.
//!
//! ```text
//!  producer ----push----+                      +--> has_next()/next()
//!                       v                      |        (consumer)
//!  callbacks --push--> [ unbounded FIFO ] -----+
//!      |                       ^
//!      +--signal_one_sequence_done()
//!              done == goal ---+ (End sentinel, Open -> Draining)
//! ```
//!
//! The sequence closes once the consumer reaches the sentinel, or immediately
//! when [`IteratorHandle::force_close`] is called from anywhere.

use futures::Stream;
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch};
use tracing::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The sequence no longer accepts units.
    #[error("sequence closed")]
    SequenceClosed,
    /// `next` was called on an exhausted sequence.
    #[error("no such element")]
    NoSuchElement,
}

/// Lifecycle of an [`InvocationIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepting pushes.
    Open,
    /// The sentinel is queued. Units queued before it are still yielded.
    Draining,
    /// The sentinel was consumed or the sequence was force-closed.
    Closed,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Open,
            1 => State::Draining,
            _ => State::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Open => 0,
            State::Draining => 1,
            State::Closed => 2,
        }
    }
}

enum Slot<T> {
    Unit(T),
    End,
}

struct Shared<T> {
    tx: mpsc::UnboundedSender<Slot<T>>,
    state: AtomicU8,
    done: AtomicUsize,
    goal: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

/// Producer half of an [`InvocationIterator`].
pub struct IteratorHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for IteratorHandle<T> {
    fn clone(&self) -> Self {
        IteratorHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> IteratorHandle<T> {
    /// Append a unit to the sequence.
    ///
    /// Fails with [`Error::SequenceClosed`] once the sequence has left
    /// [`State::Open`]: after the completion goal is met no sequence is
    /// allowed to add work, and a unit queued behind the sentinel would never
    /// be yielded.
    pub fn push(&self, unit: T) -> Result<(), Error> {
        if self.state() != State::Open {
            return Err(Error::SequenceClosed);
        }

        self.shared
            .tx
            .send(Slot::Unit(unit))
            .map_err(|_| Error::SequenceClosed)
    }

    /// Set how many logical sequences must signal completion before the
    /// iterator closes. Defaults to 1.
    pub fn register_completion_goal(&self, goal: usize) {
        self.shared.goal.store(goal, Ordering::SeqCst);
        debug!("completion goal registered: {goal}");

        if self.shared.done.load(Ordering::SeqCst) >= goal {
            self.begin_draining();
        }
    }

    /// Record that one logical sequence finished. Returns `true` for the one
    /// call that met the completion goal and queued the sentinel.
    pub fn signal_one_sequence_done(&self) -> bool {
        let done = self.shared.done.fetch_add(1, Ordering::SeqCst) + 1;
        let goal = self.shared.goal.load(Ordering::SeqCst);

        if done == goal {
            self.begin_draining()
        } else {
            if done > goal {
                warn!("sequence done signaled {done} times, but the goal is {goal}");
            }
            false
        }
    }

    /// Close the sequence immediately. Wakes a consumer blocked in
    /// [`InvocationIterator::has_next`] and discards every unit not yet
    /// yielded. Idempotent.
    pub fn force_close(&self) {
        let previous = State::from_u8(
            self.shared
                .state
                .swap(State::Closed.as_u8(), Ordering::SeqCst),
        );
        if previous != State::Closed {
            debug!("sequence force-closed while {previous:?}");
        }
        self.shared.shutdown.send_replace(true);
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn begin_draining(&self) -> bool {
        let transitioned = self
            .shared
            .state
            .compare_exchange(
                State::Open.as_u8(),
                State::Draining.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if transitioned {
            debug!("completion goal reached. draining the sequence.");
            // The receiver lives as long as the consumer half, and a dropped
            // consumer has already force-closed the sequence.
            let _ = self.shared.tx.send(Slot::End);
        }

        transitioned
    }
}

/// Consumer half: a lazily extended sequence of units of type `T`.
pub struct InvocationIterator<T> {
    rx: mpsc::UnboundedReceiver<Slot<T>>,
    shutdown: watch::Receiver<bool>,
    next: Option<Slot<T>>,
    handle: IteratorHandle<T>,
}

impl<T> Default for InvocationIterator<T> {
    fn default() -> Self {
        InvocationIterator::new()
    }
}

impl<T> InvocationIterator<T> {
    pub fn new() -> InvocationIterator<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = IteratorHandle {
            shared: Arc::new(Shared {
                tx,
                state: AtomicU8::new(State::Open.as_u8()),
                done: AtomicUsize::new(0),
                goal: AtomicUsize::new(1),
                shutdown,
            }),
        };

        InvocationIterator {
            rx,
            shutdown: shutdown_rx,
            next: None,
            handle,
        }
    }

    /// Producer handle sharing this sequence.
    pub fn handle(&self) -> IteratorHandle<T> {
        self.handle.clone()
    }

    pub fn state(&self) -> State {
        self.handle.state()
    }

    /// Wait until a unit is available or the sequence ends.
    ///
    /// A unit fetched by a previous call and not yet taken by
    /// [`next`](InvocationIterator::next) is answered without waiting.
    pub async fn has_next(&mut self) -> bool {
        if matches!(self.next, Some(Slot::End)) {
            return false;
        }
        if self.handle.state() == State::Closed {
            self.finish();
            return false;
        }
        if self.next.is_some() {
            return true;
        }

        let slot = tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|closed| *closed) => None,
            slot = self.rx.recv() => slot,
        };

        match slot {
            Some(Slot::Unit(unit)) if self.handle.state() != State::Closed => {
                self.next = Some(Slot::Unit(unit));
                true
            }
            _ => {
                self.finish();
                false
            }
        }
    }

    /// Take the next unit, waiting for it if necessary.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<T, Error> {
        if !self.has_next().await {
            return Err(Error::NoSuchElement);
        }

        match self.next.take() {
            Some(Slot::Unit(unit)) => Ok(unit),
            other => {
                self.next = other;
                Err(Error::NoSuchElement)
            }
        }
    }

    /// Consume the iterator as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut iter| async move {
            let unit = iter.next().await.ok()?;
            Some((unit, iter))
        })
    }

    fn finish(&mut self) {
        self.handle
            .shared
            .state
            .store(State::Closed.as_u8(), Ordering::SeqCst);
        self.next = Some(Slot::End);
        self.rx.close();
        let mut discarded = 0;
        while let Ok(slot) = self.rx.try_recv() {
            if matches!(slot, Slot::Unit(_)) {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!("discarded {discarded} queued units");
        }
        trace!("sequence closed");
    }
}

impl<T> Drop for InvocationIterator<T> {
    fn drop(&mut self) {
        self.handle.force_close();
    }
}
