use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// How the delay between retries of a failed stage grows.
///
/// - `Fixed`: every retry waits exactly `retry_backoff`.
/// - `Exponential`: retry `n` waits `retry_backoff * factor^n`, capped at
///   `backoff_max` when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Fixed
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!(
                "invalid backoff: {other} (expected \"fixed\" or \"exponential\")"
            )),
        }
    }
}

/// Which captured output stream a `pattern` marker is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl Default for OutputStream {
    fn default() -> Self {
        OutputStream::Stdout
    }
}

impl OutputStream {
    pub fn log_suffix(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout.log",
            OutputStream::Stderr => "stderr.log",
        }
    }
}
