//! Glue between the retry decision and the invocation sequence.
//!
//! Every attempt owns a [`RetryCoordinator`]. The host calls
//! [`on_failure`](RetryCoordinator::on_failure) when the test body fails and
//! [`on_after`](RetryCoordinator::on_after) exactly once when the attempt is
//! over. For every attempt exactly one of two things happens in `on_after`:
//! a successor is pushed onto the sequence, or the logical sequence signals
//! that it is done.

use tracing::*;

use crate::{
    iterator::{self, IteratorHandle},
    retry::{decide, Decision, RetriedSignal, RetryState},
};

/// What [`RetryCoordinator::on_after`] did with the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A successor attempt was pushed.
    Requeued,
    /// The logical sequence is finished.
    Done,
}

pub struct RetryCoordinator<T> {
    state: RetryState,
    sequence: IteratorHandle<T>,
}

impl<T> Clone for RetryCoordinator<T> {
    fn clone(&self) -> Self {
        RetryCoordinator {
            state: self.state,
            sequence: self.sequence.clone(),
        }
    }
}

impl<T> RetryCoordinator<T> {
    /// Coordinator of the first attempt of a logical sequence.
    pub fn new(max_retries: usize, sequence: IteratorHandle<T>) -> RetryCoordinator<T> {
        RetryCoordinator {
            state: RetryState::new(max_retries),
            sequence,
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Error-handling hook. Returns the error the host must observe for this
    /// attempt: a [`RetriedSignal`] wrapping `error` when the attempt is
    /// retried, `error` itself otherwise.
    pub fn on_failure(&self, error: eyre::Report) -> eyre::Report {
        match decide(&error, &self.state) {
            Decision::Retry(next) => {
                debug!(
                    "attempt {} failed, retrying ({}/{}): {error}",
                    self.state.failure_count(),
                    next.failure_count(),
                    self.state.max_retries()
                );
                eyre::Report::new(RetriedSignal::new(next.failure_count(), error))
            }
            Decision::Propagate => {
                debug!(
                    "attempt {} failed and the retry budget is spent",
                    self.state.failure_count()
                );
                error
            }
            Decision::Ignore => {
                debug!("not retrying ignored error: {error}");
                error
            }
        }
    }

    /// After-invocation hook. `observed` is the error the host associated with
    /// the attempt, if any. `successor` builds the next attempt from this
    /// coordinator's successor.
    pub fn on_after(
        &self,
        observed: Option<&eyre::Report>,
        successor: impl FnOnce(RetryCoordinator<T>) -> T,
    ) -> Result<Completion, iterator::Error> {
        let retried =
            observed.is_some_and(|error| error.downcast_ref::<RetriedSignal>().is_some());

        if retried {
            self.sequence.push(successor(self.successor()))?;
            Ok(Completion::Requeued)
        } else {
            self.sequence.signal_one_sequence_done();
            Ok(Completion::Done)
        }
    }

    /// Coordinator of the attempt that follows a failure of this one.
    pub fn successor(&self) -> RetryCoordinator<T> {
        RetryCoordinator {
            state: self.state.next(),
            sequence: self.sequence.clone(),
        }
    }
}
