pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Occurs when `retrial.toml` fails to load.
    #[error("failed to load retrial.toml: {0}")]
    LoadError(String),
    /// Occurs when a configuration value cannot be parsed.
    #[error("invalid value for \"{0}\": {1}")]
    ValueError(String, String),
    /// Occurs when a test is registered with an unusable definition.
    #[error(transparent)]
    Configuration(#[from] crate::retry::ConfigurationError),
}
