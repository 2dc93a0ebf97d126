//! # Retrial - Retry-aware async test runner
//!
//! Retrial runs async test cases and retries failed attempts. Every attempt is
//! reported on its own: a failed attempt that is going to be retried shows up
//! as skipped, retries are labeled `name[retry N]`, and only the last attempt
//! of a sequence can fail the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use retrial::{eyre, json, Arguments, Runner};
//!
//! async fn flaky() -> eyre::Result<()> {
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let mut runner = Runner::new();
//!     runner.add_test("flaky", "checkout", Arc::new(|| Box::pin(flaky())));
//!     runner.add_parameterized_test(
//!         "sum",
//!         "math",
//!         vec![
//!             Arguments::new(vec![json!(1), json!(2)]),
//!             Arguments::new(vec![json!(3), json!(4)]),
//!         ],
//!         Arc::new(|args: Arguments| {
//!             Box::pin(async move {
//!                 let a: i64 = args.get(0)?;
//!                 let b: i64 = args.get(1)?;
//!                 eyre::ensure!(a + b > 0, "sum must be positive");
//!                 eyre::Ok(())
//!             })
//!         }),
//!     )?;
//!
//!     retrial::App::new().run(runner).await
//! }
//! ```
//!
//! ## Retry budget
//!
//! The budget comes from `retry.count` in `retrial.toml`, the
//! `RETRIAL_RETRY_COUNT` environment variable or `--max-retries`, in
//! increasing order of precedence. It defaults to 0, i.e. no retry.
//!
//! ## Errors that are never retried
//!
//! Return one of these from a test, or attach it with `wrap_err`, to stop
//! retrying:
//!
//! - [`Aborted`] - the test cannot run here. Reported as skipped.
//! - [`SkipRetry`] - the failure is final.
//! - [`ConfigurationError`] - the test itself is broken.

mod app;

// Re-export error handling crates for user convenience
pub use async_trait::async_trait;
pub use eyre;
pub use pretty_assertions;
pub use serde_json::json;

// Re-export main application struct
pub use app::{App, Color};

// Re-export core functionality
pub use retrial_core::{
    config::{get_config, Config, RetryConfig},
    formatter::NameFormatter,
    invocation::{Arguments, ParameterizedTestCaseFactory, TestCaseFactory, TestFuture},
    reporter::{ListReporter, NullReporter, Reporter, ReporterType, TableReporter},
    retry::{Aborted, ConfigurationError, RetriedSignal, SkipRetry},
    runner::{self, Filter, Outcome, Runner, TestIgnoreFilter, TestInfo},
};
