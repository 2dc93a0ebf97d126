/// retrial's test runner
use eyre::WrapErr;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use once_cell::sync::Lazy;
use std::{
    collections::HashSet,
    ops::Deref,
    sync::{Arc, Mutex},
};
use tokio::{
    sync::{broadcast, Semaphore},
    task::JoinError,
};
use tracing::*;

use crate::{
    config::{get_config, RetryConfig},
    coordinator::RetryCoordinator,
    formatter::{NameFormatter, DEFAULT_PATTERN},
    invocation::{Arguments, Invocation, ParameterizedTestCaseFactory, TestCaseFactory},
    iterator::{self, InvocationIterator, IteratorHandle},
    reporter::Reporter,
    retry::{is_abort, ConfigurationError, RetriedSignal},
    Config, ModuleName, TestName,
};

pub static CHANNEL: Lazy<Mutex<Option<broadcast::Sender<Message>>>> =
    Lazy::new(|| Mutex::new(Some(broadcast::channel(1000).0)));

pub fn publish(msg: Message) -> eyre::Result<()> {
    let Ok(guard) = CHANNEL.lock() else {
        eyre::bail!("failed to acquire runner channel lock");
    };
    let Some(tx) = guard.deref() else {
        eyre::bail!("runner channel has been already closed");
    };

    tx.send(msg)
        .wrap_err("failed to publish message to the runner channel")?;

    Ok(())
}

/// Subscribe to the channel to see the real-time test execution events.
pub fn subscribe() -> eyre::Result<broadcast::Receiver<Message>> {
    let Ok(guard) = CHANNEL.lock() else {
        eyre::bail!("failed to acquire runner channel lock");
    };
    let Some(tx) = guard.deref() else {
        eyre::bail!("runner channel has been already closed");
    };

    Ok(tx.subscribe())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("panic: {0}")]
    Panicked(String),
    #[error("error: {0}")]
    ErrorReturned(String),
}

impl Error {
    fn from_report(report: &eyre::Report) -> Error {
        match report.downcast_ref::<Error>() {
            Some(e) => e.clone(),
            None => Error::ErrorReturned(format!("{report:?}")),
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Passed,
    /// Genuine failure: retries exhausted or the error is never retried.
    Failed(Error),
    /// The attempt failed and attempt `attempt` was scheduled. Reported as
    /// skipped; `cause` is what the test raised.
    Retried { attempt: usize, cause: Error },
    /// The test aborted itself. Reported as skipped.
    Aborted(Error),
}

impl Outcome {
    fn from_observed(observed: Option<&eyre::Report>) -> Outcome {
        let Some(error) = observed else {
            return Outcome::Passed;
        };

        if let Some(signal) = error.downcast_ref::<RetriedSignal>() {
            Outcome::Retried {
                attempt: signal.attempt(),
                cause: Error::from_report(signal.cause()),
            }
        } else if is_abort(error) {
            Outcome::Aborted(Error::from_report(error))
        } else {
            Outcome::Failed(Error::from_report(error))
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Retried { .. } | Outcome::Aborted(_))
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    /// An attempt starts. Carries the attempt's display name.
    Start(ModuleName, TestName),
    End(ModuleName, TestName, Test),
}

/// Result of one attempt.
#[derive(Debug, Clone)]
pub struct Test {
    pub info: TestInfo,
    /// Label shared by all attempts of the logical sequence.
    pub sequence: String,
    pub attempt: usize,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestInfo {
    pub module: String,
    pub name: String,
}

impl TestInfo {
    /// Full test name including module
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }
}

/// A registered test and how its logical sequences are produced.
#[derive(Clone)]
pub enum TestCase {
    Simple(TestCaseFactory),
    Parameterized {
        formatter: Arc<NameFormatter>,
        argument_sets: Vec<Arguments>,
        factory: ParameterizedTestCaseFactory,
    },
}

impl TestCase {
    /// Push the first attempt of every logical sequence. Returns the number of
    /// sequences.
    fn enqueue(
        &self,
        info: &TestInfo,
        sequence: &IteratorHandle<Invocation>,
        max_retries: usize,
    ) -> Result<usize, iterator::Error> {
        match self {
            TestCase::Simple(factory) => {
                sequence.push(Invocation::simple(
                    info.name.clone(),
                    Arc::clone(factory),
                    RetryCoordinator::new(max_retries, sequence.clone()),
                ))?;
                Ok(1)
            }
            TestCase::Parameterized {
                formatter,
                argument_sets,
                factory,
            } => {
                for (i, arguments) in argument_sets.iter().enumerate() {
                    sequence.push(Invocation::parameterized(
                        Arc::clone(formatter),
                        arguments.clone(),
                        i + 1,
                        Arc::clone(factory),
                        RetryCoordinator::new(max_retries, sequence.clone()),
                    ))?;
                }
                Ok(argument_sets.len())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub capture_rust: bool,
    pub terminate_channel: bool,
    /// Overrides the configured retry count.
    pub max_retries: Option<usize>,
    /// Overrides the configured thread count.
    pub threads: Option<usize>,
}

/// Test case filter trait.
pub trait Filter {
    fn filter(&self, info: &TestInfo) -> bool;
}

/// Filter test cases by module name.
pub struct ModuleFilter<'a> {
    module_names: &'a [String],
}

impl Filter for ModuleFilter<'_> {
    fn filter(&self, info: &TestInfo) -> bool {
        if self.module_names.is_empty() {
            return true;
        }

        self.module_names
            .iter()
            .any(|module_name| &info.module == module_name)
    }
}

/// Filter test cases by test name.
pub struct TestNameFilter<'a> {
    test_names: &'a [String],
}

impl Filter for TestNameFilter<'_> {
    fn filter(&self, info: &TestInfo) -> bool {
        if self.test_names.is_empty() {
            return true;
        }

        self.test_names
            .iter()
            .any(|test_name| &info.full_name() == test_name)
    }
}

/// Filter test cases by test ignore config.
pub struct TestIgnoreFilter {
    test_ignores: HashSet<String>,
}

impl TestIgnoreFilter {
    pub fn new(cfg: &Config) -> TestIgnoreFilter {
        TestIgnoreFilter {
            test_ignores: cfg.test_ignore.iter().cloned().collect(),
        }
    }
}

impl Default for TestIgnoreFilter {
    fn default() -> TestIgnoreFilter {
        TestIgnoreFilter::new(get_config())
    }
}

impl Filter for TestIgnoreFilter {
    fn filter(&self, info: &TestInfo) -> bool {
        !self.test_ignores.contains(&info.full_name())
    }
}

#[derive(Default)]
pub struct Runner {
    cfg: Config,
    options: Options,
    test_cases: Vec<(TestInfo, TestCase)>,
    reporters: Vec<Box<dyn Reporter + Send>>,
}

impl Runner {
    pub fn new() -> Runner {
        Runner::with_config(get_config().clone())
    }

    pub fn with_config(cfg: Config) -> Runner {
        Runner {
            cfg,
            options: Options::default(),
            test_cases: Vec::new(),
            reporters: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn capture_rust(&mut self) {
        self.options.capture_rust = true;
    }

    pub fn terminate_channel(&mut self) {
        self.options.terminate_channel = true;
    }

    pub fn set_max_retries(&mut self, max_retries: usize) {
        self.options.max_retries = Some(max_retries);
    }

    /// Maximum number of invocations running at the same time. Values below 1
    /// are raised to 1.
    pub fn set_threads(&mut self, threads: usize) {
        self.options.threads = Some(threads.max(1));
    }

    pub fn max_retries(&self) -> usize {
        self.options
            .max_retries
            .unwrap_or_else(|| self.cfg.max_retries())
    }

    pub fn threads(&self) -> usize {
        self.options.threads.unwrap_or(self.cfg.threads).max(1)
    }

    pub fn add_reporter(&mut self, reporter: impl Reporter + 'static + Send) {
        self.reporters.push(Box::new(reporter));
    }

    pub fn add_boxed_reporter(&mut self, reporter: Box<dyn Reporter + 'static + Send>) {
        self.reporters.push(reporter);
    }

    /// Add a test case to the runner.
    pub fn add_test(&mut self, name: &str, module: &str, factory: TestCaseFactory) {
        self.test_cases.push((
            TestInfo {
                name: name.into(),
                module: module.into(),
            },
            TestCase::Simple(factory),
        ));
    }

    /// Add a parameterized test case named after the default pattern. Every
    /// argument set becomes a logical sequence retried on its own.
    pub fn add_parameterized_test(
        &mut self,
        name: &str,
        module: &str,
        argument_sets: Vec<Arguments>,
        factory: ParameterizedTestCaseFactory,
    ) -> crate::Result<()> {
        let formatter = NameFormatter::new(DEFAULT_PATTERN, name)?
            .with_argument_max_length(self.cfg.argument_max_length);
        self.add_parameterized_test_with(name, module, formatter, argument_sets, factory)
    }

    /// Add a parameterized test case with a custom name formatter.
    pub fn add_parameterized_test_with(
        &mut self,
        name: &str,
        module: &str,
        formatter: NameFormatter,
        argument_sets: Vec<Arguments>,
        factory: ParameterizedTestCaseFactory,
    ) -> crate::Result<()> {
        if argument_sets.is_empty() {
            return Err(ConfigurationError::new(format!(
                "at least one set of arguments must be configured for parameterized test \"{module}::{name}\""
            ))
            .into());
        }

        self.test_cases.push((
            TestInfo {
                name: name.into(),
                module: module.into(),
            },
            TestCase::Parameterized {
                formatter: Arc::new(formatter),
                argument_sets,
                factory,
            },
        ));
        Ok(())
    }

    /// Run retrial runner.
    pub async fn run(&mut self, module_names: &[String], test_names: &[String]) -> eyre::Result<()> {
        if self.options.capture_rust {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }

        let mut reporters = std::mem::take(&mut self.reporters);
        let receivers = reporters
            .iter()
            .map(|_| subscribe())
            .collect::<eyre::Result<Vec<_>>>()?;

        let module_filter = ModuleFilter { module_names };
        let test_name_filter = TestNameFilter { test_names };
        let test_ignore_filter = TestIgnoreFilter::new(&self.cfg);

        let max_retries = self.max_retries();
        let retry = RetryConfig {
            count: Some(max_retries),
            ..self.cfg.retry.clone()
        };
        let threads = Arc::new(Semaphore::new(self.threads()));
        debug!(
            "running with max retries = {max_retries}, threads = {}",
            self.threads()
        );

        let handles: FuturesUnordered<_> = self
            .test_cases
            .iter()
            .filter(|(info, _)| test_name_filter.filter(info))
            .filter(|(info, _)| module_filter.filter(info))
            .filter(|(info, _)| test_ignore_filter.filter(info))
            .map(|(info, case)| {
                tokio::spawn(run_test_case(
                    info.clone(),
                    case.clone(),
                    max_retries,
                    retry.clone(),
                    Arc::clone(&threads),
                ))
            })
            .collect();

        let reporters = futures::future::join_all(
            reporters
                .iter_mut()
                .zip(receivers)
                .map(|(reporter, rx)| reporter.run(rx)),
        );

        let options = self.options.clone();
        let runner = async move {
            let mut has_any_error = false;
            let results = handles.collect::<Vec<_>>().await;
            if results.is_empty() {
                console::Term::stdout().write_line("no test cases found")?;
            }
            for result in results {
                match result {
                    Ok(Ok(failed)) => {
                        if failed {
                            has_any_error = true;
                        }
                    }
                    Ok(Err(e)) => {
                        error!("{e:#}");
                        has_any_error = true;
                    }
                    Err(e) => {
                        error!("{e}");
                        has_any_error = true;
                    }
                }
            }
            debug!("all test finished. sending stop signal to the background tasks.");

            if options.terminate_channel {
                let Ok(mut guard) = CHANNEL.lock() else {
                    eyre::bail!("failed to acquire runner channel lock");
                };
                guard.take(); // closing the runner channel.
            }

            if has_any_error {
                eyre::bail!("one or more tests failed");
            }

            eyre::Ok(())
        };

        let (handles, reporters) = tokio::join!(runner, reporters);
        for result in reporters {
            if let Err(e) = result {
                warn!("reporter failed: {e:#}");
            }
        }

        debug!("runner stopped");

        handles
    }

    pub fn list(&self) -> Vec<&TestInfo> {
        self.test_cases
            .iter()
            .map(|(info, _case)| info)
            .collect::<Vec<_>>()
    }
}

/// Drive every logical sequence of one test case to completion. Returns
/// whether any sequence ended in a genuine failure.
async fn run_test_case(
    info: TestInfo,
    case: TestCase,
    max_retries: usize,
    retry: RetryConfig,
    threads: Arc<Semaphore>,
) -> eyre::Result<bool> {
    let mut iter = InvocationIterator::new();
    let sequence = iter.handle();
    let goal = case
        .enqueue(&info, &sequence, max_retries)
        .wrap_err_with(|| format!("failed to schedule {}", info.full_name()))?;
    sequence.register_completion_goal(goal);
    debug!("{}: {goal} logical sequence(s) scheduled", info.full_name());

    let mut tasks = FuturesUnordered::new();
    let mut failed = false;
    let mut first_error = None;
    let mut settle = |joined: Result<eyre::Result<Outcome>, JoinError>| {
        match joined.map_err(eyre::Report::from).and_then(|r| r) {
            Ok(outcome) => failed |= outcome.is_failure(),
            Err(e) => {
                error!("{}: {e:#}", info.full_name());
                sequence.force_close();
                first_error.get_or_insert(e);
            }
        }
    };

    loop {
        tokio::select! {
            next = iter.next() => {
                let Ok(invocation) = next else {
                    break;
                };
                tasks.push(tokio::spawn(execute(
                    info.clone(),
                    invocation,
                    retry.clone(),
                    Arc::clone(&threads),
                )));
            }
            Some(joined) = tasks.next(), if !tasks.is_empty() => settle(joined),
        }
    }

    while let Some(joined) = tasks.next().await {
        settle(joined);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(failed),
    }
}

/// Run one attempt: body, error-handling hook, report, after-invocation hook.
async fn execute(
    info: TestInfo,
    invocation: Invocation,
    retry: RetryConfig,
    threads: Arc<Semaphore>,
) -> eyre::Result<Outcome> {
    let attempt = invocation.attempt();
    if let Some(delay) = retry.delay_before(attempt) {
        debug!("waiting {delay:?} before attempt {attempt}");
        tokio::time::sleep(delay).await;
    }
    let _permit = threads
        .acquire_owned()
        .await
        .wrap_err("failed to acquire an execution slot")?;

    let test_name = invocation.display_name();
    if let Err(e) = publish(Message::Start(info.module.clone(), test_name.clone())) {
        trace!("{e:#}");
    }

    let res = std::panic::AssertUnwindSafe(async { invocation.execute().await })
        .catch_unwind()
        .await;

    let error = match res {
        Ok(Ok(_)) => {
            debug!("{test_name} ok");
            None
        }
        Ok(Err(e)) => {
            debug!("{test_name} failed: {e:#}");
            Some(e)
        }
        Err(e) => {
            let panic_message = if let Some(panic_message) = e.downcast_ref::<&str>() {
                format!("{test_name} failed with message: {panic_message}")
            } else if let Some(panic_message) = e.downcast_ref::<String>() {
                format!("{test_name} failed with message: {panic_message}")
            } else {
                format!("{test_name} failed with unknown message")
            };
            debug!("{panic_message}");
            Some(eyre::Report::new(Error::Panicked(panic_message)))
        }
    };

    let observed = error.map(|e| invocation.on_failure(e));
    let outcome = Outcome::from_observed(observed.as_ref());

    let test = Test {
        info: info.clone(),
        sequence: invocation.base_name(),
        attempt,
        outcome: outcome.clone(),
    };
    if let Err(e) = publish(Message::End(info.module.clone(), test_name.clone(), test)) {
        trace!("{e:#}");
    }

    invocation
        .on_after(observed.as_ref())
        .wrap_err_with(|| format!("failed to complete {test_name}"))?;

    Ok(outcome)
}
