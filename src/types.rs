use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::journal::LogLine;
use crate::ports;

/// Classification of a single evaluated port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Filtered => "filtered",
        }
    }

    /// Closed ports are evaluated but never surfaced.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, PortStatus::Closed)
    }
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified finding for a port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub status: PortStatus,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PortResult {
    /// Build a result, labelling the port from the well-known service table.
    /// A version is kept only for open ports.
    pub fn new(port: u16, status: PortStatus, version: Option<String>) -> Self {
        Self {
            port,
            status,
            service: ports::service_name(port).to_string(),
            version: if status == PortStatus::Open { version } else { None },
        }
    }

    pub fn open(port: u16, version: Option<String>) -> Self {
        Self::new(port, PortStatus::Open, version)
    }

    pub fn closed(port: u16) -> Self {
        Self::new(port, PortStatus::Closed, None)
    }

    pub fn filtered(port: u16) -> Self {
        Self::new(port, PortStatus::Filtered, None)
    }
}

/// A validated scan request: non-empty target and a non-empty, in-range port list.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    target: String,
    port_range: String,
    #[serde(skip)]
    ports: Vec<u16>,
}

impl ScanRequest {
    pub fn new(target: impl AsRef<str>, port_range: impl AsRef<str>) -> Result<Self, ScanError> {
        let target = target.as_ref().trim();
        if target.is_empty() {
            return Err(ScanError::InvalidRequest("target must not be empty".into()));
        }
        let port_range = port_range.as_ref().trim();
        let ports = ports::parse_port_range(port_range)?;
        Ok(Self {
            target: target.to_string(),
            port_range: port_range.to_string(),
            ports,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn port_range(&self) -> &str {
        &self.port_range
    }

    /// Ports in evaluation order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

/// Lifecycle state of the scan session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Completed,
}

/// The mutable record of one scan request and everything it has published so far.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ScanSession {
    pub request: Option<ScanRequest>,
    pub state: SessionState,
    pub progress: f64,
    pub processed: u64,
    pub total: u64,
    pub results: Vec<PortResult>,
    pub log: Vec<LogLine>,
}

impl ScanSession {
    /// Fresh session for a new request: progress at 0, no results, no log.
    pub fn running(request: ScanRequest) -> Self {
        Self {
            total: request.ports().len() as u64,
            request: Some(request),
            state: SessionState::Running,
            ..Self::default()
        }
    }

    pub fn open_count(&self) -> usize {
        self.count_with(PortStatus::Open)
    }

    pub fn filtered_count(&self) -> usize {
        self.count_with(PortStatus::Filtered)
    }

    fn count_with(&self, status: PortStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Incremental notifications published while a scan runs.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    Started { target: String, total: u64 },
    Progress { percent: f64, processed: u64, total: u64 },
    Result(PortResult),
    Log(LogLine),
    Completed { open: u64, processed: u64 },
    Cancelled { processed: u64 },
}
