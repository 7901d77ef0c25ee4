//! CLI command implementations.

pub mod catalog;
pub mod tail;

use thiserror::Error;

/// Errors raised while interpreting command-line arguments.
#[derive(Debug, Error)]
pub enum ArgError {
    /// An argument did not have the expected `key=value` shape.
    #[error("expected {expected}, got '{value}'")]
    Malformed {
        /// The expected shape.
        expected: &'static str,
        /// The offending value.
        value: String,
    },

    /// Unknown output format.
    #[error("unknown output format '{0}' (expected text or json)")]
    Format(String),
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// One JSON document per line.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ArgError::Format(other.to_string())),
        }
    }
}

/// Splits `key=value`.
pub fn split_assignment<'a>(
    value: &'a str,
    expected: &'static str,
) -> Result<(&'a str, &'a str), ArgError> {
    match value.split_once('=') {
        Some((key, rest)) if !key.trim().is_empty() => Ok((key.trim(), rest)),
        _ => Err(ArgError::Malformed {
            expected,
            value: value.to_string(),
        }),
    }
}
