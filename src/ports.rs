use std::collections::HashSet;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Named port selections offered next to free-form ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortPreset {
    /// Well-known ports, 1-1024.
    Common,
    /// Every TCP port.
    All,
    /// A handful of web and admin services.
    Web,
}

impl PortPreset {
    pub fn port_range(self) -> &'static str {
        match self {
            PortPreset::Common => "1-1024",
            PortPreset::All => "1-65535",
            PortPreset::Web => "80,443,22,21,3306",
        }
    }
}

/// Well-known TCP services used to label findings.
const SERVICES: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (8080, "HTTP-Proxy"),
    (8443, "HTTPS-Alt"),
    (27017, "MongoDB"),
];

/// Service label for a port, or `"Unknown"` when the port is not in the table.
pub fn service_name(port: u16) -> &'static str {
    SERVICES
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

/// Parse a port range expression into the ordered list of ports to evaluate.
///
/// Supported formats:
/// - inclusive range: `1-1000`
/// - literal list: `80,443,22` (order kept, duplicates dropped)
///
/// Whitespace around tokens is ignored. The result is never empty.
pub fn parse_port_range(s: &str) -> Result<Vec<u16>, ScanError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid("port range must not be empty"));
    }

    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port_str(a.trim())
            .map_err(|e| invalid(format!("invalid start in range: {e}")))?;
        let end = parse_port_str(b.trim())
            .map_err(|e| invalid(format!("invalid end in range: {e}")))?;
        if start > end {
            return Err(invalid(format!("invalid range {start}-{end} (start > end)")));
        }
        return Ok((start..=end).collect());
    }

    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();
    for token in s.split(',') {
        let p = parse_port_str(token.trim()).map_err(invalid)?;
        if seen.insert(p) {
            out.push(p);
        }
    }
    Ok(out)
}

fn parse_port_str(s: &str) -> Result<u16, String> {
    if s.is_empty() {
        return Err("missing port value".into());
    }
    let val: u32 = s
        .parse::<u32>()
        .map_err(|e| format!("invalid port value {s:?}: {e}"))?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}

fn invalid(msg: impl Into<String>) -> ScanError {
    ScanError::InvalidRequest(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inclusive_range() {
        let ports = parse_port_range("20-25").unwrap();
        assert_eq!(ports, vec![20, 21, 22, 23, 24, 25]);
    }

    #[test]
    fn parse_list_keeps_order_and_dedups() {
        let ports = parse_port_range(" 80, 443 ,22,80").unwrap();
        assert_eq!(ports, vec![80, 443, 22]);
    }

    #[test]
    fn single_port_is_a_list_of_one() {
        assert_eq!(parse_port_range("8080").unwrap(), vec![8080]);
        assert_eq!(parse_port_range("7-7").unwrap(), vec![7]);
    }

    #[test]
    fn invalid_values_error() {
        for bad in ["", "abc", "0", "70000", "10-5", "1-", "-5", "80,,443", "1-2-3"] {
            let err = parse_port_range(bad);
            assert!(
                matches!(err, Err(ScanError::InvalidRequest(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn presets_expand_to_port_lists() {
        assert_eq!(parse_port_range(PortPreset::Common.port_range()).unwrap().len(), 1024);
        assert_eq!(parse_port_range(PortPreset::All.port_range()).unwrap().len(), 65535);
        assert_eq!(
            parse_port_range(PortPreset::Web.port_range()).unwrap(),
            vec![80, 443, 22, 21, 3306]
        );
        assert_eq!(PortPreset::from_str("web", true), Ok(PortPreset::Web));
    }

    #[test]
    fn service_table_labels_known_ports() {
        assert_eq!(service_name(21), "FTP");
        assert_eq!(service_name(27017), "MongoDB");
        assert_eq!(service_name(8443), "HTTPS-Alt");
        assert_eq!(service_name(4444), "Unknown");
        assert_eq!(SERVICES.len(), 19);
    }
}
