//! Configuration error types

/// Errors produced while loading or validating the bouncer configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The document could not be read from disk
    Read {
        path: String,
        reason: String,
    },
    /// The document is not valid YAML
    Parse {
        reason: String,
    },
    /// A configuration value is invalid
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    /// A required configuration value is missing
    MissingRequired {
        key: String,
        hint: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, reason } => {
                write!(f, "Unable to read configuration at {}: {}", path, reason)
            }
            ConfigError::Parse { reason } => {
                write!(f, "Unable to parse configuration: {}", reason)
            }
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
            ConfigError::MissingRequired { key, hint } => {
                write!(f, "Missing required configuration: {} ({})", key, hint)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
