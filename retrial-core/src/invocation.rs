//! The units of work scheduled by the runner.
//!
//! An [`Invocation`] is one attempt of a logical sequence. It comes in two
//! shapes: [`SimpleInvocation`] runs a test without arguments, and
//! [`ParameterizedInvocation`] runs a test with one argument set. Each element
//! of a parameterized test is its own logical sequence and is retried
//! independently of its siblings.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    coordinator::{Completion, RetryCoordinator},
    formatter::NameFormatter,
    iterator,
    retry::{ConfigurationError, RetryState},
};

pub type TestFuture = Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>>;

/// Builds the future of a test without arguments. Called once per attempt.
pub type TestCaseFactory = Arc<dyn Fn() -> TestFuture + Sync + Send + 'static>;

/// Builds the future of a parameterized test from one argument set.
pub type ParameterizedTestCaseFactory =
    Arc<dyn Fn(Arguments) -> TestFuture + Sync + Send + 'static>;

/// One argument set of a parameterized test. Cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Arguments(Arc<[Value]>);

impl Arguments {
    pub fn new(values: Vec<Value>) -> Arguments {
        Arguments(values.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Deserialize the argument at `index`. A missing or mistyped argument is
    /// a [`ConfigurationError`], so it is never retried.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> eyre::Result<T> {
        let value = self.0.get(index).ok_or_else(|| {
            ConfigurationError::new(format!(
                "argument {index} requested, but only {} provided",
                self.0.len()
            ))
        })?;

        serde_json::from_value(value.clone()).map_err(|e| {
            ConfigurationError::new(format!("argument {index} cannot be resolved: {e}")).into()
        })
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(values: Vec<Value>) -> Self {
        Arguments::new(values)
    }
}

pub struct SimpleInvocation {
    name: String,
    factory: TestCaseFactory,
    coordinator: RetryCoordinator<Invocation>,
}

pub struct ParameterizedInvocation {
    formatter: Arc<NameFormatter>,
    arguments: Arguments,
    index: usize,
    factory: ParameterizedTestCaseFactory,
    coordinator: RetryCoordinator<Invocation>,
}

/// One attempt of a logical sequence.
pub enum Invocation {
    Simple(SimpleInvocation),
    Parameterized(ParameterizedInvocation),
}

impl Invocation {
    /// First attempt of a test without arguments.
    pub fn simple(
        name: impl Into<String>,
        factory: TestCaseFactory,
        coordinator: RetryCoordinator<Invocation>,
    ) -> Invocation {
        Invocation::Simple(SimpleInvocation {
            name: name.into(),
            factory,
            coordinator,
        })
    }

    /// First attempt of the `index`-th (1-based) argument set of a
    /// parameterized test.
    pub fn parameterized(
        formatter: Arc<NameFormatter>,
        arguments: Arguments,
        index: usize,
        factory: ParameterizedTestCaseFactory,
        coordinator: RetryCoordinator<Invocation>,
    ) -> Invocation {
        Invocation::Parameterized(ParameterizedInvocation {
            formatter,
            arguments,
            index,
            factory,
            coordinator,
        })
    }

    /// Label shared by every attempt of the logical sequence.
    pub fn base_name(&self) -> String {
        match self {
            Invocation::Simple(inv) => inv.name.clone(),
            Invocation::Parameterized(inv) => inv.formatter.format(inv.index, &inv.arguments),
        }
    }

    /// Label of this attempt, suffixed with `[retry N]` for retries.
    pub fn display_name(&self) -> String {
        self.retry_state().label(&self.base_name())
    }

    pub fn retry_state(&self) -> &RetryState {
        self.coordinator().state()
    }

    /// Attempt number, starting at 0.
    pub fn attempt(&self) -> usize {
        self.retry_state().failure_count()
    }

    pub fn arguments(&self) -> Option<&Arguments> {
        match self {
            Invocation::Simple(_) => None,
            Invocation::Parameterized(inv) => Some(&inv.arguments),
        }
    }

    /// Build the test future, injecting the arguments of a parameterized
    /// invocation.
    pub fn execute(&self) -> TestFuture {
        match self {
            Invocation::Simple(inv) => (inv.factory)(),
            Invocation::Parameterized(inv) => (inv.factory)(inv.arguments.clone()),
        }
    }

    /// Error-handling hook, see [`RetryCoordinator::on_failure`].
    pub fn on_failure(&self, error: eyre::Report) -> eyre::Report {
        self.coordinator().on_failure(error)
    }

    /// After-invocation hook, see [`RetryCoordinator::on_after`].
    pub fn on_after(
        &self,
        observed: Option<&eyre::Report>,
    ) -> Result<Completion, iterator::Error> {
        self.coordinator()
            .on_after(observed, |coordinator| self.with_coordinator(coordinator))
    }

    /// The invocation of the next attempt.
    pub fn successor(&self) -> Invocation {
        self.with_coordinator(self.coordinator().successor())
    }

    fn coordinator(&self) -> &RetryCoordinator<Invocation> {
        match self {
            Invocation::Simple(inv) => &inv.coordinator,
            Invocation::Parameterized(inv) => &inv.coordinator,
        }
    }

    fn with_coordinator(&self, coordinator: RetryCoordinator<Invocation>) -> Invocation {
        match self {
            Invocation::Simple(inv) => Invocation::Simple(SimpleInvocation {
                name: inv.name.clone(),
                factory: Arc::clone(&inv.factory),
                coordinator,
            }),
            Invocation::Parameterized(inv) => Invocation::Parameterized(ParameterizedInvocation {
                formatter: Arc::clone(&inv.formatter),
                arguments: inv.arguments.clone(),
                index: inv.index,
                factory: Arc::clone(&inv.factory),
                coordinator,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{formatter::DEFAULT_PATTERN, iterator::InvocationIterator, retry::RetriedSignal};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn always_fails() -> eyre::Result<()> {
        eyre::bail!("always fails")
    }

    fn failing() -> TestCaseFactory {
        Arc::new(|| Box::pin(always_fails()))
    }

    #[tokio::test]
    async fn display_names_across_retries() -> eyre::Result<()> {
        let mut iter = InvocationIterator::new();
        let handle = iter.handle();
        handle.push(Invocation::simple(
            "X",
            failing(),
            RetryCoordinator::new(2, handle.clone()),
        ))?;

        let mut names = Vec::new();
        while let Ok(invocation) = iter.next().await {
            names.push(invocation.display_name());
            let error = invocation.execute().await.unwrap_err();
            let observed = invocation.on_failure(error);
            invocation.on_after(Some(&observed))?;
        }

        assert_eq!(names, vec!["X", "X[retry 1]", "X[retry 2]"]);
        Ok(())
    }

    #[tokio::test]
    async fn parameterized_arguments_are_injected() -> eyre::Result<()> {
        let seen = Arc::new(AtomicUsize::new(0));
        let factory: ParameterizedTestCaseFactory = {
            let seen = seen.clone();
            Arc::new(move |args: Arguments| {
                let seen = seen.clone();
                Box::pin(async move {
                    let a: usize = args.get(0)?;
                    let b: usize = args.get(1)?;
                    seen.fetch_add(a + b, Ordering::SeqCst);
                    eyre::Ok(())
                })
            })
        };

        let iter = InvocationIterator::new();
        let formatter = Arc::new(
            NameFormatter::new(DEFAULT_PATTERN, "sum")?.with_parameter_names(["a", "b"]),
        );
        let invocation = Invocation::parameterized(
            formatter,
            Arguments::new(vec![json!(1), json!(2)]),
            1,
            factory,
            RetryCoordinator::new(1, iter.handle()),
        );

        assert_eq!(invocation.display_name(), "[1] a=1, b=2");
        invocation.execute().await?;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let successor = invocation.successor();
        assert_eq!(successor.display_name(), "[1] a=1, b=2[retry 1]");
        assert_eq!(successor.arguments(), invocation.arguments());
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_argument_is_not_retried() {
        let factory: ParameterizedTestCaseFactory = Arc::new(|args: Arguments| {
            Box::pin(async move {
                let _: String = args.get(3)?;
                eyre::Ok(())
            })
        });

        let iter = InvocationIterator::new();
        let invocation = Invocation::parameterized(
            Arc::new(NameFormatter::new("{0}", "t").unwrap()),
            Arguments::new(vec![json!(1)]),
            1,
            factory,
            RetryCoordinator::new(3, iter.handle()),
        );

        let error = invocation.execute().await.unwrap_err();
        let observed = invocation.on_failure(error);
        assert!(observed.downcast_ref::<RetriedSignal>().is_none());
        assert!(observed.downcast_ref::<ConfigurationError>().is_some());
        assert_eq!(invocation.on_after(Some(&observed)), Ok(Completion::Done));
    }
}
