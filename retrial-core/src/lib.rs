//! # Retrial Core
//!
//! Core functionality of retrial, a retry-aware invocation scheduler for test
//! hosts.
//!
//! This crate provides the fundamental building blocks of retrial, including:
//! - An extensible invocation iterator that retries re-enter while it is consumed
//! - Per-attempt retry state and the retry decision
//! - Display names of parameterized invocations
//! - The test runner and its event channel
//! - Configuration management
//! - Test reporting infrastructure
//!
//! ## Architecture (block diagram)
//!
//! ```text
//! +---------------------+      +---------------------+      +---------------------+
//! | registered tests    | ---> | runner (execution) | --->  | reporter (output)   |
//! | simple/parameterized|      | + event channel    |       | List/Table/Null     |
//! +---------------------+      +---------------------+      +---------------------+
//!                                   |          ^
//!                                   v          | successor
//!                        +---------------------+---+      +---------------------+
//!                        | invocation iterator     | <--- | retry coordinator   |
//!                        | (one per test case)     |      | decide + RetryState |
//!                        +-------------------------+      +---------------------+
//!                                   ^
//!                                   |
//!                        +-------------------------+
//!                        | config + filters        |
//!                        | retry budget, threads   |
//!                        +-------------------------+
//! ```
//!
//! Most users should use the main `retrial` crate rather than importing
//! `retrial-core` directly.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod formatter;
pub mod invocation;
pub mod iterator;
pub mod reporter;
pub mod retry;
#[doc(hidden)]
pub mod runner;

// Re-export error handling crates
pub use eyre;

/// Type alias for module names in test organization.
///
/// Module names group related tests together and are used for filtering and
/// organizing test output.
pub type ModuleName = String;

/// Type alias for attempt names.
///
/// The display name of one attempt, e.g. `login` or `login[retry 1]`.
pub type TestName = String;

// Re-export key functionality
pub use config::{get_config, Config, RetryConfig};
pub use coordinator::{Completion, RetryCoordinator};
pub use error::{Error, Result};
pub use formatter::NameFormatter;
pub use invocation::{
    Arguments, Invocation, ParameterizedTestCaseFactory, TestCaseFactory, TestFuture,
};
pub use iterator::{InvocationIterator, IteratorHandle};
pub use reporter::{ListReporter, NullReporter, Reporter, ReporterType, TableReporter};
pub use retry::{
    decide, Aborted, ConfigurationError, Decision, RetriedSignal, RetryState, SkipRetry,
};
pub use runner::{
    Filter, ModuleFilter, Outcome, Runner, TestIgnoreFilter, TestInfo, TestNameFilter,
};
