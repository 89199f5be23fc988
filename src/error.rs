use thiserror::Error;

/// Errors surfaced to callers of the scan engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Empty target or a port range that does not resolve to valid ports.
    /// Raised before any session is touched.
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("a scan is already running")]
    ConcurrentScanConflict,

    #[error("no scan is running")]
    NotRunning,
}

/// Failure of a single port probe. Never fatal to the scan.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No answer within the probe timeout; reported as filtered.
    #[error("probe of port {port} timed out")]
    Timeout { port: u16 },

    /// Any other probe failure; the port is left out of the results.
    #[error("probe of port {port} failed: {source}")]
    Io {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl ProbeError {
    pub fn port(&self) -> u16 {
        match self {
            ProbeError::Timeout { port } | ProbeError::Io { port, .. } => *port,
        }
    }
}
