//! Scan log entries.
//!
//! The log is a human-readable, timestamped mirror of the findings: one line
//! when a scan starts, one per open or filtered port, and a closing summary.
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};

use crate::types::PortResult;

/// Presentation category of a log line, derived from its text.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Open,
    Filtered,
    Complete,
    Info,
}

/// One timestamped scan log entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub message: String,
}

impl LogLine {
    pub fn new(at: OffsetDateTime, message: impl Into<String>) -> Self {
        Self {
            at,
            message: message.into(),
        }
    }

    pub fn started(at: OffsetDateTime, target: &str) -> Self {
        Self::new(at, format!("Initializing scan on {target}..."))
    }

    pub fn finding(at: OffsetDateTime, result: &PortResult) -> Self {
        Self::new(
            at,
            format!(
                "Port {}: {} - {}",
                result.port,
                result.status.as_str().to_uppercase(),
                result.service
            ),
        )
    }

    pub fn completed(at: OffsetDateTime, open: u64) -> Self {
        Self::new(at, format!("Scan complete. Found {open} open ports."))
    }

    /// Keyword classification used by presentation layers. Not stored.
    pub fn kind(&self) -> LogKind {
        if self.message.contains("OPEN") {
            LogKind::Open
        } else if self.message.contains("FILTERED") {
            LogKind::Filtered
        } else if self.message.contains("complete") {
            LogKind::Complete
        } else {
            LogKind::Info
        }
    }

    /// Wall-clock part of the timestamp, `HH:MM:SS`.
    pub fn clock_time(&self) -> String {
        self.at
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_else(|_| String::from("--:--:--"))
    }
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.clock_time(), self.message)
    }
}
