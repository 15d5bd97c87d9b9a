pub mod buffer;

use qbee_shared::report::{Report, Severity};
use std::sync::Mutex;

const REDACTED: &str = "********";

/// Collects severity-tagged records during a single reconciliation run.
/// Secret values are replaced before a record is appended, so the stored
/// list never contains them. Optionally mirrors each record to stdout.
pub struct Reporter {
    commit_id: String,
    to_console: bool,
    secrets: Vec<String>,
    records: Mutex<Vec<Report>>,
}

impl Reporter {
    pub fn new(commit_id: impl Into<String>, to_console: bool, secrets: Vec<String>) -> Self {
        Self {
            commit_id: commit_id.into(),
            to_console,
            secrets: secrets.into_iter().filter(|s| !s.is_empty()).collect(),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Handle scoped to one bundle; every record it appends carries the
    /// bundle name and bundle commit id.
    pub fn bundle<'a>(&'a self, bundle: &str, bundle_commit_id: &str) -> BundleReporter<'a> {
        BundleReporter {
            reporter: self,
            bundle: bundle.to_string(),
            bundle_commit_id: bundle_commit_id.to_string(),
        }
    }

    pub fn reports(&self) -> Vec<Report> {
        self.records.lock().expect("reporter lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .expect("reporter lock poisoned")
            .is_empty()
    }

    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            out = out.replace(secret, REDACTED);
        }
        out
    }

    fn append(
        &self,
        bundle: &str,
        bundle_commit_id: &str,
        severity: Severity,
        text: &str,
        log: &str,
    ) {
        let text = self.redact(text);
        let log = self.redact(log);

        if self.to_console {
            println!("[{severity}] {text}");
        }

        let report = Report {
            bundle: bundle.to_string(),
            bundle_commit_id: bundle_commit_id.to_string(),
            commit_id: self.commit_id.clone(),
            labels: String::new(),
            severity,
            text,
            log: Report::encode_log(&log),
            timestamp: chrono::Utc::now().timestamp(),
        };

        self.records
            .lock()
            .expect("reporter lock poisoned")
            .push(report);
    }
}

/// Per-bundle reporting handle handed to executors.
pub struct BundleReporter<'a> {
    reporter: &'a Reporter,
    bundle: String,
    bundle_commit_id: String,
}

impl BundleReporter<'_> {
    pub fn info(&self, text: impl AsRef<str>) {
        self.reporter.append(
            &self.bundle,
            &self.bundle_commit_id,
            Severity::Info,
            text.as_ref(),
            "",
        );
    }

    pub fn warn(&self, text: impl AsRef<str>) {
        self.reporter.append(
            &self.bundle,
            &self.bundle_commit_id,
            Severity::Warn,
            text.as_ref(),
            "",
        );
    }

    pub fn err(&self, text: impl AsRef<str>) {
        self.reporter.append(
            &self.bundle,
            &self.bundle_commit_id,
            Severity::Err,
            text.as_ref(),
            "",
        );
    }

    /// ERR with an auxiliary output tail (stored base64-encoded).
    pub fn err_with_log(&self, text: impl AsRef<str>, log: impl AsRef<str>) {
        self.reporter.append(
            &self.bundle,
            &self.bundle_commit_id,
            Severity::Err,
            text.as_ref(),
            log.as_ref(),
        );
    }
}

/// A record built outside any run reporter, e.g. appended straight to the
/// on-disk buffer while the control plane is unreachable.
pub fn standalone_report(
    commit_id: &str,
    bundle: &str,
    severity: Severity,
    text: &str,
) -> Report {
    Report {
        bundle: bundle.to_string(),
        bundle_commit_id: String::new(),
        commit_id: commit_id.to_string(),
        labels: String::new(),
        severity,
        text: text.to_string(),
        log: String::new(),
        timestamp: chrono::Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_carry_run_and_bundle_identity() {
        let reporter = Reporter::new("commit-1", false, vec![]);
        reporter.bundle("ntp", "bundle-7").info("Configured NTP servers");

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].commit_id, "commit-1");
        assert_eq!(reports[0].bundle, "ntp");
        assert_eq!(reports[0].bundle_commit_id, "bundle-7");
        assert_eq!(reports[0].severity, Severity::Info);
    }

    #[test]
    fn test_secret_values_are_redacted_in_text_and_log() {
        let reporter = Reporter::new("c", false, vec!["hunter2".to_string()]);
        let bundle = reporter.bundle("users", "b");
        bundle.err_with_log(
            "Unable to add user hunter2",
            "useradd: user hunter2 exists",
        );

        let report = &reporter.reports()[0];
        assert!(!report.text.contains("hunter2"));
        assert!(report.text.contains("********"));
        // Redaction happens before base64 encoding.
        assert!(!report.decode_log().contains("hunter2"));
        assert!(report.decode_log().contains("********"));
    }

    #[test]
    fn test_multiple_secrets_all_redacted() {
        let reporter = Reporter::new(
            "c",
            false,
            vec!["alpha".to_string(), "beta".to_string(), String::new()],
        );
        reporter.bundle("b", "bc").warn("alpha saw beta");
        let report = &reporter.reports()[0];
        assert_eq!(report.text, "******** saw ********");
    }

    #[test]
    fn test_reports_preserve_append_order() {
        let reporter = Reporter::new("c", false, vec![]);
        let bundle = reporter.bundle("firewall", "bc");
        bundle.warn("first");
        bundle.info("second");
        bundle.err("third");

        let texts: Vec<_> = reporter.reports().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }
}
