use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Severity of a single report record. The wire names are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERR")]
    Err,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Err => write!(f, "ERR"),
        }
    }
}

/// One record produced during a reconciliation run. Immutable once
/// collected; delivered to the control plane as JSON lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub bundle_commit_id: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub labels: String,
    pub severity: Severity,
    pub text: String,
    /// Base64-encoded auxiliary text (command output tails). May be empty.
    #[serde(default)]
    pub log: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Report {
    pub fn encode_log(log: &str) -> String {
        if log.is_empty() {
            String::new()
        } else {
            BASE64.encode(log.as_bytes())
        }
    }

    pub fn decode_log(&self) -> String {
        if self.log.is_empty() {
            return String::new();
        }
        match BASE64.decode(self.log.as_bytes()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        Report {
            bundle: "file_distribution".to_string(),
            bundle_commit_id: "bc1".to_string(),
            commit_id: "c1".to_string(),
            labels: String::new(),
            severity: Severity::Info,
            text: "Successfully downloaded file foo.deb to /tmp/out".to_string(),
            log: Report::encode_log("some output"),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let report = sample_report();
        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: Report = serde_json::from_str(&encoded).unwrap();
        assert_eq!(report, decoded);
    }

    #[test]
    fn test_severity_wire_names() {
        assert_eq!(serde_json::to_string(&Severity::Info).unwrap(), "\"INFO\"");
        assert_eq!(serde_json::to_string(&Severity::Warn).unwrap(), "\"WARN\"");
        assert_eq!(serde_json::to_string(&Severity::Err).unwrap(), "\"ERR\"");
    }

    #[test]
    fn test_log_encoding_round_trip() {
        let report = sample_report();
        assert_eq!(report.decode_log(), "some output");
    }

    #[test]
    fn test_empty_log_stays_empty() {
        assert_eq!(Report::encode_log(""), "");
        let mut report = sample_report();
        report.log = String::new();
        assert_eq!(report.decode_log(), "");
    }
}
