use console::{style, Term};
use eyre::WrapErr;
use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast;
use tracing::*;

use crate::{
    runner::{self, Outcome, Test},
    ModuleName, TestName,
};

/// Reporter trait. The trait is based on the "template method" pattern.
/// You can implement on_xxx methods to hook into the test runner. This way is enough for most usecases.
/// If you need more control, you can override the "run" method.
#[async_trait::async_trait]
pub trait Reporter {
    /// Consume runner events until the channel is closed. `rx` must be
    /// subscribed before the runner starts publishing.
    async fn run(&mut self, mut rx: broadcast::Receiver<runner::Message>) -> eyre::Result<()> {
        loop {
            match rx.recv().await {
                Ok(runner::Message::Start(module_name, test_name)) => {
                    self.on_start(module_name, test_name).await?;
                }
                Ok(runner::Message::End(module_name, test_name, test)) => {
                    self.on_end(module_name, test_name, test).await?;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("runner channel has been closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("reporter lagged behind, {n} message(s) dropped");
                    continue;
                }
            }
        }

        self.on_finish().await
    }

    /// Called when an attempt starts.
    async fn on_start(&mut self, _module: ModuleName, _test_name: TestName) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when an attempt ends.
    async fn on_end(
        &mut self,
        _module: ModuleName,
        _test_name: TestName,
        _test: Test,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called once after the last event.
    async fn on_finish(&mut self) -> eyre::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReporterType {
    Null,
    #[default]
    List,
    Table,
}

pub struct NullReporter;

#[async_trait::async_trait]
impl Reporter for NullReporter {}

/// Prints one line per attempt as soon as it ends.
pub struct ListReporter {
    terminal: Term,
}

impl ListReporter {
    pub fn new() -> ListReporter {
        ListReporter {
            terminal: Term::stdout(),
        }
    }
}

impl Default for ListReporter {
    fn default() -> Self {
        ListReporter::new()
    }
}

#[async_trait::async_trait]
impl Reporter for ListReporter {
    async fn on_end(
        &mut self,
        module_name: ModuleName,
        test_name: TestName,
        test: Test,
    ) -> eyre::Result<()> {
        let line = match &test.outcome {
            Outcome::Passed => format!("{} {module_name}::{test_name}", style("✓").green()),
            Outcome::Failed(e) => {
                format!("{} {module_name}::{test_name}: {e:#}", style("✘").red())
            }
            Outcome::Retried { attempt, cause } => format!(
                "{} {module_name}::{test_name}: {} {cause}",
                style("↻").yellow(),
                style(format!("retrying (x{attempt})")).dim()
            ),
            Outcome::Aborted(e) => {
                format!("{} {module_name}::{test_name}: {e}", style("-").yellow())
            }
        };

        self.terminal
            .write_line(&line)
            .wrap_err("failed to write character on terminal")
    }
}

/// Identifies a logical sequence across its attempts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SequenceKey {
    module: String,
    test: String,
    sequence: String,
}

#[derive(Tabled)]
struct SummaryRow {
    test: String,
    sequence: String,
    attempts: usize,
    result: String,
}

/// Prints a summary table per logical sequence once the run is over.
#[derive(Default)]
pub struct TableReporter {
    sequences: BTreeMap<SequenceKey, (usize, Outcome)>,
}

impl TableReporter {
    pub fn new() -> TableReporter {
        TableReporter::default()
    }

    fn rows(&self) -> Vec<SummaryRow> {
        self.sequences
            .iter()
            .map(|(key, (attempts, outcome))| SummaryRow {
                test: format!("{}::{}", key.module, key.test),
                sequence: key.sequence.clone(),
                attempts: *attempts,
                result: match outcome {
                    Outcome::Passed => "passed".into(),
                    Outcome::Failed(_) => "failed".into(),
                    Outcome::Retried { .. } => "retrying".into(),
                    Outcome::Aborted(_) => "aborted".into(),
                },
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Reporter for TableReporter {
    async fn on_end(
        &mut self,
        _module_name: ModuleName,
        _test_name: TestName,
        test: Test,
    ) -> eyre::Result<()> {
        let key = SequenceKey {
            module: test.info.module,
            test: test.info.name,
            sequence: test.sequence,
        };
        let attempts = test.attempt + 1;
        let entry = self.sequences.entry(key).or_insert((0, Outcome::Passed));
        if attempts >= entry.0 {
            *entry = (attempts, test.outcome);
        }
        Ok(())
    }

    async fn on_finish(&mut self) -> eyre::Result<()> {
        let rows = self.rows();
        if rows.is_empty() {
            return Ok(());
        }

        let mut table = Table::new(rows);
        table.with(Style::sharp());
        Term::stdout()
            .write_line(&table.to_string())
            .wrap_err("failed to write character on terminal")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::{Error, TestInfo};
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    fn attempt(sequence: &str, attempt: usize, outcome: Outcome) -> Test {
        Test {
            info: TestInfo {
                module: "m".into(),
                name: "t".into(),
            },
            sequence: sequence.into(),
            attempt,
            outcome,
        }
    }

    #[test]
    fn reporter_type_from_str() {
        assert_eq!(ReporterType::from_str("table").ok(), Some(ReporterType::Table));
        assert_eq!(ReporterType::from_str("list").ok(), Some(ReporterType::List));
        assert!(ReporterType::from_str("html").is_err());
    }

    #[tokio::test]
    async fn table_keeps_the_last_attempt_of_each_sequence() -> eyre::Result<()> {
        let (tx, rx) = broadcast::channel(16);
        let retried = Outcome::Retried {
            attempt: 1,
            cause: Error::ErrorReturned("boom".into()),
        };
        for test in [
            attempt("[1] a", 0, retried),
            attempt("[2] b", 0, Outcome::Passed),
            attempt("[1] a", 1, Outcome::Passed),
        ] {
            tx.send(runner::Message::End("m".into(), test.sequence.clone(), test))?;
        }
        drop(tx);

        let mut reporter = TableReporter::new();
        reporter.run(rx).await?;

        let summary: Vec<_> = reporter
            .rows()
            .into_iter()
            .map(|row| (row.sequence, row.attempts, row.result))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("[1] a".to_string(), 2, "passed".to_string()),
                ("[2] b".to_string(), 1, "passed".to_string()),
            ]
        );
        Ok(())
    }
}
