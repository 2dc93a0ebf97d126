//! Per-attempt retry state and the retry decision.
//!
//! Every attempt of a logical sequence carries its own [`RetryState`]. When the
//! test body fails, [`decide`] looks at the raised error and the state and
//! tells the caller whether to retry, propagate the error as a genuine failure,
//! or leave it alone because it belongs to the ignored taxonomy.
//!
//! ```text
//!                 +------------------+
//!  error -------> | ignored type?    | --yes--> Ignore     (re-raise verbatim)
//!                 +------------------+
//!                          | no
//!                          v
//!                 +------------------+
//!                 | budget exhausted?| --yes--> Propagate  (re-raise verbatim)
//!                 +------------------+
//!                          | no
//!                          v
//!                  Retry(next state)  --------> RetriedSignal wraps the error
//! ```

use std::{error::Error as StdError, fmt};

/// Immutable retry bookkeeping for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    failure_count: usize,
    max_retries: usize,
}

impl RetryState {
    /// State of the first attempt of a logical sequence.
    pub fn new(max_retries: usize) -> RetryState {
        RetryState {
            failure_count: 0,
            max_retries,
        }
    }

    /// Number of failed attempts that preceded this one. Also the attempt number.
    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Whether a failure of this attempt must be reported as terminal.
    pub fn is_exhausted(&self) -> bool {
        self.failure_count >= self.max_retries
    }

    /// State of the attempt that follows a failure of this one.
    pub fn next(&self) -> RetryState {
        RetryState {
            failure_count: self.failure_count + 1,
            max_retries: self.max_retries,
        }
    }

    /// Display label of this attempt: `base` for the first attempt,
    /// `base[retry N]` afterwards.
    pub fn label(&self, base: &str) -> String {
        if self.failure_count == 0 {
            base.to_string()
        } else {
            format!("{base}[retry {}]", self.failure_count)
        }
    }
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Raise a [`RetriedSignal`] and schedule an attempt with the given state.
    Retry(RetryState),
    /// The budget is spent. The original error is a genuine failure.
    Propagate,
    /// The error is in the ignored taxonomy. Re-raise it untouched.
    Ignore,
}

/// Decide what to do with an error raised by the attempt described by `state`.
///
/// The ignored check always runs first and always against the error the test
/// body raised, never against a wrapper.
pub fn decide(error: &eyre::Report, state: &RetryState) -> Decision {
    if is_ignored(error) {
        Decision::Ignore
    } else if state.is_exhausted() {
        Decision::Propagate
    } else {
        Decision::Retry(state.next())
    }
}

/// The test aborted itself, e.g. because a precondition of the environment
/// does not hold. Never retried.
///
/// Like every ignored type, it also stops retries when it is the `source()`
/// of another error, so a lower layer can abort through its own error type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("test aborted: {0}")]
pub struct Aborted(pub String);

impl Aborted {
    pub fn new(reason: impl Into<String>) -> Aborted {
        Aborted(reason.into())
    }
}

/// The test or its registration is misconfigured. Never retried.
#[derive(Debug, Clone, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> ConfigurationError {
        ConfigurationError(message.into())
    }
}

/// Raised (or attached with `wrap_err`) by a test that knows retrying its
/// failure is pointless.
///
/// Any error whose `source()` chain contains a `SkipRetry` is final as well,
/// including one raised by a helper the test calls.
#[derive(Debug, Clone, thiserror::Error)]
#[error("retry skipped: {0}")]
pub struct SkipRetry(pub String);

impl SkipRetry {
    pub fn new(message: impl Into<String>) -> SkipRetry {
        SkipRetry(message.into())
    }
}

/// Raised instead of the original error when an attempt is going to be
/// retried. Hosts report the attempt as skipped and treat [`cause`] as the
/// real failure.
///
/// [`cause`]: RetriedSignal::cause
pub struct RetriedSignal {
    attempt: usize,
    cause: eyre::Report,
}

impl RetriedSignal {
    pub fn new(attempt: usize, cause: eyre::Report) -> RetriedSignal {
        RetriedSignal { attempt, cause }
    }

    /// Attempt number of the retry this signal schedules.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The error the failed attempt actually raised.
    pub fn cause(&self) -> &eyre::Report {
        &self.cause
    }

    pub fn into_cause(self) -> eyre::Report {
        self.cause
    }
}

impl fmt::Debug for RetriedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetriedSignal")
            .field("attempt", &self.attempt)
            .field("cause", &format_args!("{}", self.cause))
            .finish()
    }
}

impl fmt::Display for RetriedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retrying test (x{})", self.attempt)
    }
}

impl StdError for RetriedSignal {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.cause)
    }
}

/// Whether `error` belongs to the ignored taxonomy.
///
/// A report matches when it downcasts to one of the ignored types, which
/// also covers ignored types attached as `wrap_err` context, or when any
/// error in its source chain is one of them.
pub fn is_ignored(error: &eyre::Report) -> bool {
    error.downcast_ref::<Aborted>().is_some()
        || error.downcast_ref::<ConfigurationError>().is_some()
        || error.downcast_ref::<SkipRetry>().is_some()
        || error.downcast_ref::<RetriedSignal>().is_some()
        || error.chain().any(is_ignored_cause)
}

/// Whether `error` aborted the test rather than failed it. Aborted attempts
/// are reported as skipped.
pub fn is_abort(error: &eyre::Report) -> bool {
    error.downcast_ref::<Aborted>().is_some()
        || error.downcast_ref::<RetriedSignal>().is_some()
        || error
            .chain()
            .any(|cause| cause.is::<Aborted>() || cause.is::<RetriedSignal>())
}

fn is_ignored_cause(cause: &(dyn StdError + 'static)) -> bool {
    // RetriedSignal is an abort.
    cause.is::<Aborted>()
        || cause.is::<ConfigurationError>()
        || cause.is::<SkipRetry>()
        || cause.is::<RetriedSignal>()
}

#[cfg(test)]
mod test {
    use super::*;
    use eyre::WrapErr;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[derive(Debug, thiserror::Error)]
    #[error("database unavailable")]
    struct DatabaseUnavailable(#[source] Aborted);

    #[test_case(0, "login"; "first attempt")]
    #[test_case(1, "login[retry 1]"; "first retry")]
    #[test_case(7, "login[retry 7]"; "seventh retry")]
    fn label(failures: usize, expected: &str) {
        let mut state = RetryState::new(10);
        for _ in 0..failures {
            state = state.next();
        }
        assert_eq!(state.label("login"), expected);
    }

    #[test]
    fn next_is_derived_without_touching_the_original() {
        let first = RetryState::new(2);
        let second = first.next();
        assert_eq!(first.failure_count(), 0);
        assert_eq!(second.failure_count(), 1);
        assert_eq!(second.max_retries(), 2);
    }

    #[test_case(0, 0, true; "no retry budget")]
    #[test_case(2, 1, false; "budget left")]
    #[test_case(2, 2, true; "budget spent")]
    fn exhausted(max_retries: usize, failures: usize, expected: bool) {
        let mut state = RetryState::new(max_retries);
        for _ in 0..failures {
            state = state.next();
        }
        assert_eq!(state.is_exhausted(), expected);
    }

    #[test]
    fn decide_retry_while_budget_remains() {
        let state = RetryState::new(2);
        let decision = decide(&eyre::eyre!("boom"), &state);
        assert_eq!(decision, Decision::Retry(state.next()));
    }

    #[test]
    fn decide_propagate_when_exhausted() {
        let state = RetryState::new(1).next();
        assert_eq!(decide(&eyre::eyre!("boom"), &state), Decision::Propagate);
    }

    #[test]
    fn decide_ignore_takes_precedence_over_budget() {
        let state = RetryState::new(5);
        let decision = decide(&eyre::Report::new(Aborted::new("no network")), &state);
        assert_eq!(decision, Decision::Ignore);

        let exhausted = RetryState::new(0);
        let decision = decide(&eyre::Report::new(SkipRetry::new("flaky")), &exhausted);
        assert_eq!(decision, Decision::Ignore);
    }

    #[test]
    fn ignored_types() {
        assert!(is_ignored(&eyre::Report::new(Aborted::new("a"))));
        assert!(is_ignored(&eyre::Report::new(ConfigurationError::new("c"))));
        assert!(is_ignored(&eyre::Report::new(SkipRetry::new("s"))));
        assert!(is_ignored(&eyre::Report::new(RetriedSignal::new(
            1,
            eyre::eyre!("inner")
        ))));
        assert!(!is_ignored(&eyre::eyre!("plain failure")));
    }

    #[test]
    fn only_aborts_are_aborts() {
        assert!(is_abort(&eyre::Report::new(Aborted::new("a"))));
        assert!(is_abort(&eyre::Report::new(DatabaseUnavailable(
            Aborted::new("no db")
        ))));
        assert!(!is_abort(&eyre::Report::new(SkipRetry::new("s"))));
        assert!(!is_abort(&eyre::Report::new(ConfigurationError::new("c"))));
        assert!(!is_abort(&eyre::eyre!("plain failure")));
    }

    #[test]
    fn ignored_as_context() {
        let report: eyre::Result<()> = Err(eyre::eyre!("timeout"));
        let report = report
            .wrap_err(SkipRetry::new("upstream is down"))
            .unwrap_err();
        assert!(is_ignored(&report));
    }

    #[test]
    fn ignored_in_source_chain() {
        let report = eyre::Report::new(DatabaseUnavailable(Aborted::new("no db")));
        assert!(is_ignored(&report));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("fixture unavailable")]
    struct FixtureUnavailable(#[source] SkipRetry);

    #[test]
    fn skip_retry_from_a_lower_layer_is_final() {
        let state = RetryState::new(3);
        let report = eyre::Report::new(FixtureUnavailable(SkipRetry::new("missing file")));
        assert_eq!(decide(&report, &state), Decision::Ignore);
        assert!(!is_abort(&report));
    }

    #[test]
    fn retried_signal_keeps_the_cause() {
        let signal = RetriedSignal::new(3, eyre::eyre!("original"));
        assert_eq!(signal.attempt(), 3);
        assert_eq!(signal.to_string(), "retrying test (x3)");
        assert_eq!(signal.cause().to_string(), "original");
        assert_eq!(
            signal.source().map(|source| source.to_string()),
            Some("original".to_string())
        );
        assert_eq!(signal.into_cause().to_string(), "original");
    }
}
