//! Timeout policies
//!
//! What a bridge call produces when no reply arrives before the deadline.
//! Filters and readers have separate vocabularies; a value that is not part
//! of the mode's vocabulary is rejected when the node is initialized, never
//! at the first timeout.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Timeout behaviour for request/response (filter) bridges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterTimeoutAction {
    /// Produce no output for the request
    #[default]
    Drop,
    /// Forward the original request item unchanged
    PassThrough,
}

impl FilterTimeoutAction {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterTimeoutAction::Drop => "drop",
            FilterTimeoutAction::PassThrough => "passthrough",
        }
    }
}

impl FromStr for FilterTimeoutAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop" => Ok(FilterTimeoutAction::Drop),
            // "input" is the historical spelling
            "passthrough" | "input" => Ok(FilterTimeoutAction::PassThrough),
            other => Err(Error::UnhandledPolicy {
                action: other.to_string(),
                mode: "filter".into(),
                supported: "drop, passthrough".into(),
            }),
        }
    }
}

impl fmt::Display for FilterTimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout behaviour for wait-only (reader) bridges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderTimeoutAction {
    /// Wait again, indefinitely, until a payload arrives
    #[default]
    KeepWaiting,
    /// End the stream
    Stop,
}

impl ReaderTimeoutAction {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderTimeoutAction::KeepWaiting => "keep-waiting",
            ReaderTimeoutAction::Stop => "stop",
        }
    }
}

impl FromStr for ReaderTimeoutAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-waiting" => Ok(ReaderTimeoutAction::KeepWaiting),
            "stop" => Ok(ReaderTimeoutAction::Stop),
            other => Err(Error::UnhandledPolicy {
                action: other.to_string(),
                mode: "reader".into(),
                supported: "keep-waiting, stop".into(),
            }),
        }
    }
}

impl fmt::Display for ReaderTimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
