use clap::{value_parser, Arg, ArgAction, ArgMatches, Command as ClapCommand};
use console::Term;
use eyre::OptionExt;
use itertools::Itertools;
use std::{
    collections::{HashMap, VecDeque},
    ffi::OsString,
    str::FromStr,
};
use tracing::*;

use crate::{
    Filter, ListReporter, NullReporter, Reporter, ReporterType, Runner, TableReporter,
    TestIgnoreFilter,
};

/// Build the CLI with clap's builder pattern
fn build_cli<'a>(third_party_reporters: impl Iterator<Item = &'a String>) -> ClapCommand {
    let mut reporter_choices: VecDeque<_> = third_party_reporters.map(|s| s.to_string()).collect();
    reporter_choices.push_front(ReporterType::Null.to_string());
    reporter_choices.push_front(ReporterType::Table.to_string());
    reporter_choices.push_front(ReporterType::List.to_string());
    ClapCommand::new("retrial")
        .about("retrial CLI offers various commands, including listing and executing test cases")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("test")
                .about("Run tests, retrying failed attempts")
                .arg(Arg::new("capture-rust")
                    .long("capture-rust")
                    .help("Capture Rust \"tracing\" based logs, including retrial's internal scheduling logs. Filtered by RUST_LOG")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("modules")
                    .short('m')
                    .long("modules")
                    .help("Specify modules to run in comma-separated string. --modules foo,bar")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("tests")
                    .short('t')
                    .long("tests")
                    .help("Specify test cases to run in comma-separated string. e.g. --tests foo::a,bar::b")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("reporters")
                    .long("reporters")
                    .help(format!("Specify the reporters to use in comma-separated string. Default is \"list\". [possible values: {}]", reporter_choices.into_iter().join(", ")))
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("max-retries")
                    .short('r')
                    .long("max-retries")
                    .help("Maximum number of retries of a failed attempt. Overrides \"retry.count\" in retrial.toml")
                    .value_parser(value_parser!(usize)))
                .arg(Arg::new("threads")
                    .short('j')
                    .long("threads")
                    .help("Maximum number of attempts to run in parallel. Overrides \"threads\" in retrial.toml")
                    .value_parser(value_parser!(usize)))
                .arg(Arg::new("color")
                    .long("color")
                    .help("Produce color output. Default is \"auto\" [env: CARGO_TERM_COLOR]")
                    .value_parser(["auto", "always", "never"]))
        )
        .subcommand(
            ClapCommand::new("ls")
                .about("List test cases")
        )
}

/// Options of the `test` subcommand.
#[derive(Debug, Clone, Default, PartialEq)]
struct TestArgs {
    capture_rust: bool,
    modules: Vec<String>,
    tests: Vec<String>,
    reporters: Option<Vec<String>>,
    max_retries: Option<usize>,
    threads: Option<usize>,
    color: Option<Color>,
}

impl TestArgs {
    fn from_matches(matches: &ArgMatches) -> TestArgs {
        let many = |id: &str| {
            matches
                .get_many::<String>(id)
                .map(|vals| vals.cloned().collect::<Vec<_>>())
        };

        TestArgs {
            capture_rust: matches.get_flag("capture-rust"),
            modules: many("modules").unwrap_or_default(),
            tests: many("tests").unwrap_or_default(),
            reporters: many("reporters"),
            max_retries: matches.get_one::<usize>("max-retries").cloned(),
            threads: matches.get_one::<usize>("threads").cloned(),
            color: matches
                .get_one::<String>("color")
                .and_then(|s| Color::from_str(s).ok()),
        }
    }
}

/// retrial CLI.
#[derive(Default)]
pub struct App {
    third_party_reporters: HashMap<String, Box<dyn Reporter + 'static + Send>>,
}

impl App {
    pub fn new() -> App {
        App {
            third_party_reporters: HashMap::new(),
        }
    }

    /// Install a third-party reporter.
    pub fn install_reporter(
        &mut self,
        name: impl Into<String>,
        reporter: impl Reporter + 'static + Send,
    ) {
        self.third_party_reporters
            .insert(name.into(), Box::new(reporter));
    }

    /// Parse command-line args and run retrial CLI sub command.
    pub async fn run(self, runner: Runner) -> eyre::Result<()> {
        color_eyre::install()?;
        self.run_from(runner, std::env::args_os()).await
    }

    /// Run retrial CLI sub command with the given args. The first arg is the
    /// binary name.
    pub async fn run_from<I, T>(mut self, mut runner: Runner, args: I) -> eyre::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = build_cli(self.third_party_reporters.keys()).try_get_matches_from(args)?;
        let term = Term::stdout();

        match matches.subcommand() {
            Some(("test", test_matches)) => {
                let args = TestArgs::from_matches(test_matches);
                debug!("{args:?}");

                if args.capture_rust {
                    runner.capture_rust();
                }
                if let Some(max_retries) = args.max_retries {
                    runner.set_max_retries(max_retries);
                }
                if let Some(threads) = args.threads {
                    runner.set_threads(threads);
                }
                runner.terminate_channel();

                let mut reporters = std::mem::take(&mut self.third_party_reporters);
                reporters.extend([
                    (ReporterType::Null.to_string(), Box::new(NullReporter)),
                    (
                        ReporterType::Table.to_string(),
                        Box::new(TableReporter::new()),
                    ),
                    (ReporterType::List.to_string(), Box::new(ListReporter::new())),
                ]
                    as [(String, Box<dyn Reporter + 'static + Send>); 3]);

                let selected = args
                    .reporters
                    .unwrap_or_else(|| vec![ReporterType::List.to_string()]);
                for reporter in selected {
                    runner.add_boxed_reporter(
                        reporters
                            .remove(&reporter)
                            .ok_or_else(|| eyre::eyre!("Unknown reporter: {reporter}"))?,
                    );
                }

                let color_env = std::env::var("CARGO_TERM_COLOR");
                let color = match (args.color, color_env) {
                    (color @ Some(Color::Always), _) => color,
                    (color @ Some(Color::Never), _) => color,
                    (None, Ok(color)) => Color::from_str(&color).ok(),
                    _ => None,
                };
                match color {
                    Some(Color::Always) => {
                        console::set_colors_enabled(true);
                        console::set_colors_enabled_stderr(true);
                    }
                    Some(Color::Never) => {
                        console::set_colors_enabled(false);
                        console::set_colors_enabled_stderr(false);
                    }
                    _ => {}
                }

                runner.run(&args.modules, &args.tests).await
            }
            Some(("ls", _)) => {
                let filter = TestIgnoreFilter::new(runner.config());
                let list = runner.list();
                let test_case_by_module = list.iter().into_group_map_by(|test| test.module.clone());
                for module in test_case_by_module.keys().sorted() {
                    term.write_line(&format!("* {module}"))?;
                    for test_case in test_case_by_module
                        .get(module)
                        .ok_or_eyre("module not found")?
                    {
                        if !filter.filter(test_case) {
                            continue;
                        }
                        term.write_line(&format!("  - {}", test_case.full_name()))?;
                    }
                }

                Ok(())
            }
            _ => unreachable!("Subcommand required is set to true"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn parse(args: &[&str]) -> TestArgs {
        let matches = build_cli(std::iter::empty())
            .try_get_matches_from(std::iter::once("retrial").chain(args.iter().copied()))
            .unwrap();
        let (name, test_matches) = matches.subcommand().unwrap();
        assert_eq!(name, "test");
        TestArgs::from_matches(test_matches)
    }

    #[test]
    fn defaults() {
        assert_eq!(parse(&["test"]), TestArgs::default());
    }

    #[test]
    fn all_options() {
        let args = parse(&[
            "test",
            "--capture-rust",
            "--modules",
            "checkout,login",
            "--tests",
            "checkout::pay",
            "--reporters",
            "list,table",
            "--max-retries",
            "3",
            "--threads",
            "8",
            "--color",
            "never",
        ]);
        assert_eq!(
            args,
            TestArgs {
                capture_rust: true,
                modules: vec!["checkout".into(), "login".into()],
                tests: vec!["checkout::pay".into()],
                reporters: Some(vec!["list".into(), "table".into()]),
                max_retries: Some(3),
                threads: Some(8),
                color: Some(Color::Never),
            }
        );
    }

    #[test_case(&["test", "--max-retries", "-1"]; "negative retries")]
    #[test_case(&["test", "--threads", "many"]; "non numeric threads")]
    #[test_case(&["test", "--color", "sometimes"]; "unknown color")]
    #[test_case(&[]; "missing subcommand")]
    fn rejected(args: &[&str]) {
        let result = build_cli(std::iter::empty())
            .try_get_matches_from(std::iter::once("retrial").chain(args.iter().copied()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_reporter_is_an_error() {
        let runner = Runner::with_config(crate::Config::default());
        let result = App::new()
            .run_from(runner, ["retrial", "test", "--reporters", "html"])
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Unknown reporter: html"));
    }
}
