//! # Configuration Module
//!
//! Handles loading retrial configuration from `retrial.toml` and the
//! environment. The configuration is read once, the first time it is needed,
//! and never changes afterwards.
//!
//! ## Configuration Loading Flow (block diagram)
//!
//! ```text
//! +-------------------+     +-------------------+     +-------------------+
//! | RETRIAL_CONFIG    | --> | Path resolution   | --> | retrial.toml file |
//! | (optional)        |     | or default ./     |     |                   |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!                                                              v
//! +-------------------+     +-------------------+     +-------------------+
//! | RETRIAL_RETRY_    | --> | override parsed   | --> | Config struct     |
//! | COUNT, _THREAD_   |     | values            |     | (static, once)    |
//! | COUNT env vars    |     |                   |     |                   |
//! +-------------------+     +-------------------+     +-------------------+
//! ```
//!
//! ## Configuration Structure
//!
//! ```toml
//! threads = 4
//! argument_max_length = 512
//! test_ignore = ["checkout::slow_payment"]
//!
//! [retry]
//! count = 2
//! factor = 2.0
//! jitter = false
//! min_delay = "100ms"
//! max_delay = "5s"
//! ```
//!
//! Without a configuration file retrial does not retry (`retry.count = 0`)
//! and runs one invocation at a time (`threads = 1`).

use backon::BackoffBuilder;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{io::Read, path::Path, time::Duration};
use tracing::*;

use crate::{formatter::DEFAULT_ARGUMENT_MAX_LENGTH, Error, Result};

/// Environment variable name for specifying the config file path.
const RETRIAL_CONFIG_ENV: &str = "RETRIAL_CONFIG";
/// Overrides `retry.count`.
const RETRIAL_RETRY_COUNT_ENV: &str = "RETRIAL_RETRY_COUNT";
/// Overrides `threads`.
const RETRIAL_THREAD_COUNT_ENV: &str = "RETRIAL_THREAD_COUNT";

static CONFIG: Lazy<Config> = Lazy::new(|| {
    let _ = dotenv::dotenv();
    Config::load().unwrap_or_else(|e| {
        error!("{e}. falling back to the default configuration");
        Config::default()
    })
});

/// Process-wide configuration, loaded on first access.
pub fn get_config() -> &'static Config {
    &CONFIG
}

/// retrial's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Retry policy applied to every test.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Maximum number of invocations running at the same time.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Parameterized arguments longer than this are truncated in display names.
    #[serde(default = "default_argument_max_length")]
    pub argument_max_length: usize,
    /// Tests (`module::name`) never run.
    #[serde(default)]
    pub test_ignore: Vec<String>,
}

fn default_threads() -> usize {
    1
}

fn default_argument_max_length() -> usize {
    DEFAULT_ARGUMENT_MAX_LENGTH
}

impl Default for Config {
    fn default() -> Self {
        Config {
            retry: RetryConfig::default(),
            threads: default_threads(),
            argument_max_length: default_argument_max_length(),
            test_ignore: Vec::new(),
        }
    }
}

impl Config {
    /// Load retrial configuration from path. A missing file yields the
    /// defaults.
    fn load_from(path: &Path) -> Result<Config> {
        let Ok(mut file) = std::fs::File::open(path) else {
            debug!("{path:?} not found. using the default configuration");
            return Ok(Config::default());
        };

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| Error::LoadError(e.to_string()))?;

        let cfg: Config = toml::from_str(&buf).map_err(|e| {
            Error::LoadError(format!(
                "failed to deserialize retrial.toml into retrial::Config: {e}"
            ))
        })?;
        cfg.validate()?;

        debug!("retrial.toml was successfully loaded: {cfg:#?}");

        Ok(cfg)
    }

    /// Load retrial configuration.
    ///
    /// Loading order:
    /// 1. If `RETRIAL_CONFIG` env var is set, load from that path
    /// 2. Otherwise, load from `retrial.toml` in the current directory
    /// 3. Apply `RETRIAL_RETRY_COUNT` and `RETRIAL_THREAD_COUNT`
    fn load() -> Result<Config> {
        let mut cfg = match std::env::var(RETRIAL_CONFIG_ENV) {
            Ok(path) => {
                let path = Path::new(&path);

                // Detect misuse: if it doesn't look like a file path, error out
                if path.extension().is_none_or(|ext| ext != "toml")
                    && !path.to_string_lossy().contains(std::path::MAIN_SEPARATOR)
                    && !path.to_string_lossy().contains('/')
                {
                    return Err(Error::LoadError(format!(
                        "{RETRIAL_CONFIG_ENV} should be a path to a config file, not a config value. \
                         Got: {:?}. Use {RETRIAL_RETRY_COUNT_ENV} or {RETRIAL_THREAD_COUNT_ENV} to override values instead.",
                        path
                    )));
                }

                if !path.exists() {
                    return Err(Error::LoadError(format!(
                        "Config file specified by {RETRIAL_CONFIG_ENV} not found: {:?}",
                        path
                    )));
                }

                debug!("Loading config from {RETRIAL_CONFIG_ENV}={:?}", path);
                Config::load_from(path)?
            }
            Err(_) => Config::load_from(Path::new("retrial.toml"))?,
        };

        cfg.load_env(std::env::vars())?;
        Ok(cfg)
    }

    /// Apply overrides from environment variables.
    fn load_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                RETRIAL_RETRY_COUNT_ENV => {
                    let count = parse_usize(&key, &value)?;
                    debug!("retry count overridden by {key}: {count}");
                    self.retry.count = Some(count);
                }
                RETRIAL_THREAD_COUNT_ENV => {
                    let threads = parse_usize(&key, &value)?;
                    debug!("thread count overridden by {key}: {threads}");
                    self.threads = threads;
                }
                _ => {}
            }
        }

        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::ValueError(
                "threads".into(),
                "at least one thread is required".into(),
            ));
        }
        Ok(())
    }

    /// Maximum number of retries after the first attempt.
    pub fn max_retries(&self) -> usize {
        self.retry.max_retries()
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::ValueError(key.to_string(), format!("{value:?}: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Number of retries.
    #[serde(default)]
    pub count: Option<usize>,
    /// Factor to multiply the delay between retries.
    #[serde(default)]
    pub factor: Option<f32>,
    /// Whether to add jitter to the delay between retries.
    #[serde(default)]
    pub jitter: Option<bool>,
    /// Delay before the first retry. Retries are immediate when unset.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub min_delay: Option<Duration>,
    /// Maximum delay between retries.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            count: Some(0),
            factor: Some(2.0),
            jitter: Some(false),
            min_delay: None,
            max_delay: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    pub fn max_retries(&self) -> usize {
        self.count.unwrap_or_default()
    }

    /// Exponential backoff between attempts, if a delay is configured.
    pub fn backoff(&self) -> Option<backon::ExponentialBuilder> {
        let min_delay = self.min_delay?;
        let builder = backon::ExponentialBuilder::new()
            .with_max_times(self.max_retries())
            .with_factor(self.factor.unwrap_or(2.0))
            .with_min_delay(min_delay)
            .with_max_delay(self.max_delay.unwrap_or(Duration::from_secs(60)));

        if self.jitter.unwrap_or_default() {
            Some(builder.with_jitter())
        } else {
            Some(builder)
        }
    }

    /// How long to wait before running attempt `attempt`. The first attempt
    /// never waits.
    pub fn delay_before(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        self.backoff()?.build().nth(attempt - 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use test_case::test_case;

    fn sample_config_path() -> std::path::PathBuf {
        let manifest_dir = env!("CARGO_MANIFEST_DIR");
        Path::new(manifest_dir).join("../retrial-sample.toml")
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn load_config() -> eyre::Result<()> {
        let cfg = Config::load_from(&sample_config_path())?;
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.argument_max_length, 64);
        assert_eq!(cfg.test_ignore, vec!["checkout::slow_payment".to_string()]);
        assert_eq!(cfg.retry.count, Some(2));
        assert_eq!(cfg.retry.factor, Some(2.0));
        assert_eq!(cfg.retry.jitter, Some(false));
        assert_eq!(cfg.retry.min_delay, Some(Duration::from_millis(100)));
        assert_eq!(cfg.retry.max_delay, Some(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> eyre::Result<()> {
        let cfg = Config::load_from(Path::new("/nonexistent/retrial.toml"))?;
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.max_retries(), 0);
        assert_eq!(cfg.argument_max_length, DEFAULT_ARGUMENT_MAX_LENGTH);
        assert!(cfg.test_ignore.is_empty());
        Ok(())
    }

    #[test]
    fn env_overrides() -> eyre::Result<()> {
        let mut cfg = Config::default();
        cfg.load_env(vars(&[
            ("RETRIAL_RETRY_COUNT", "3"),
            ("RETRIAL_THREAD_COUNT", " 8 "),
            ("UNRELATED", "x"),
        ]))?;
        assert_eq!(cfg.max_retries(), 3);
        assert_eq!(cfg.threads, 8);
        Ok(())
    }

    #[test_case("RETRIAL_RETRY_COUNT", "many"; "retry count is not a number")]
    #[test_case("RETRIAL_THREAD_COUNT", "-1"; "negative thread count")]
    #[test_case("RETRIAL_THREAD_COUNT", "0"; "zero threads")]
    fn invalid_env_override(key: &str, value: &str) {
        let mut cfg = Config::default();
        let err = cfg.load_env(vars(&[(key, value)])).unwrap_err();
        assert!(matches!(err, Error::ValueError(..)), "{err}");
    }

    #[test]
    fn no_delay_by_default() {
        let retry = RetryConfig {
            count: Some(3),
            ..Default::default()
        };
        assert_eq!(retry.delay_before(1), None);
    }

    #[test]
    fn exponential_delay_between_attempts() {
        let retry = RetryConfig {
            count: Some(3),
            min_delay: Some(Duration::from_millis(100)),
            max_delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let millis = |attempt| retry.delay_before(attempt).map(|d| d.as_millis());
        assert_eq!(millis(0), None);
        assert_eq!(millis(1), Some(100));
        assert_eq!(millis(2), Some(200));
        assert_eq!(millis(3), Some(300));
        assert_eq!(millis(4), None);
    }

    mod retrial_config_env {
        use super::{sample_config_path, Config, RETRIAL_CONFIG_ENV};
        use pretty_assertions::assert_eq;
        use serial_test::serial;
        use test_case::test_case;

        #[test]
        #[serial]
        fn load_from_retrial_config_env() {
            std::env::set_var(RETRIAL_CONFIG_ENV, sample_config_path().to_str().unwrap());
            let cfg = Config::load().unwrap();
            std::env::remove_var(RETRIAL_CONFIG_ENV);

            assert_eq!(cfg.threads, 4);
        }

        #[test]
        #[serial]
        fn error_when_file_not_found() {
            std::env::set_var(RETRIAL_CONFIG_ENV, "/nonexistent/path/retrial.toml");
            let result = Config::load();
            std::env::remove_var(RETRIAL_CONFIG_ENV);

            assert!(result.is_err());
            let err = result.unwrap_err().to_string();
            assert!(err.contains("not found"), "error should mention file not found: {err}");
        }

        #[test_case("true"; "boolean value")]
        #[test_case("123"; "numeric value")]
        #[serial]
        fn error_when_value_looks_like_config_value(value: &str) {
            std::env::set_var(RETRIAL_CONFIG_ENV, value);
            let result = Config::load();
            std::env::remove_var(RETRIAL_CONFIG_ENV);

            assert!(result.is_err());
            let err = result.unwrap_err().to_string();
            assert!(
                err.contains("should be a path"),
                "error should guide user: {err}"
            );
        }
    }

    #[test]
    #[serial]
    fn retry_count_env_applies_on_load() {
        std::env::set_var(RETRIAL_CONFIG_ENV, sample_config_path().to_str().unwrap());
        std::env::set_var(RETRIAL_RETRY_COUNT_ENV, "5");
        let cfg = Config::load();
        std::env::remove_var(RETRIAL_RETRY_COUNT_ENV);
        std::env::remove_var(RETRIAL_CONFIG_ENV);

        assert_eq!(cfg.unwrap().max_retries(), 5);
    }
}
