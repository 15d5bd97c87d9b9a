use anyhow::{Context, Result};
use qbee_shared::report::Report;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Buffered records expire after 30 days.
const MAX_REPORT_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Append-only JSON-Lines queue of undelivered reports, kept under the
/// agent directory as `reports.jsonl` (mode 0600).
pub struct ReportBuffer {
    path: PathBuf,
}

impl ReportBuffer {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            path: app_dir.join("reports.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        }
    }

    /// Append records as JSON lines and fsync so they survive power loss.
    pub fn append(&self, reports: &[Report]) -> Result<()> {
        if reports.is_empty() {
            return Ok(());
        }

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("failed to open report buffer {}", self.path.display()))?;

        let mut payload = Vec::new();
        for report in reports {
            serde_json::to_writer(&mut payload, report).context("failed to encode report")?;
            payload.push(b'\n');
        }

        file.write_all(&payload)
            .context("failed to append to report buffer")?;
        file.sync_all().context("failed to fsync report buffer")?;
        Ok(())
    }

    /// Read all non-expired records. Corrupt bytes are skipped to the next
    /// line so valid tail records are never lost.
    pub fn read(&self) -> Result<Vec<Report>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read report buffer {}", self.path.display())
                });
            }
        };

        let mut reports = decode_recovering(&content);

        let cutoff = chrono::Utc::now().timestamp() - MAX_REPORT_AGE_SECS;
        reports.retain(|r| r.timestamp >= cutoff);
        Ok(reports)
    }

    /// Replace the buffer content with the undelivered tail.
    pub fn rewrite(&self, reports: &[Report]) -> Result<()> {
        if reports.is_empty() {
            return self.clear();
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.create(true).write(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options
                .open(&tmp)
                .with_context(|| format!("failed to open {}", tmp.display()))?;
            for report in reports {
                serde_json::to_writer(&mut file, report).context("failed to encode report")?;
                file.write_all(b"\n")?;
            }
            file.sync_all().context("failed to fsync report buffer")?;
        }
        std::fs::rename(&tmp, &self.path).context("failed to replace report buffer")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove report buffer"),
        }
    }
}

/// Stream-decode JSON lines; on a syntax error, advance past the bad bytes
/// (using the decoder's reported offset) to the next newline and continue.
fn decode_recovering(content: &str) -> Vec<Report> {
    let mut out = Vec::new();
    let mut rest = content;

    loop {
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Report>();
        let mut failed_at = None;
        while let Some(item) = stream.next() {
            match item {
                Ok(report) => out.push(report),
                Err(_) => {
                    failed_at = Some(stream.byte_offset());
                    break;
                }
            }
        }

        let Some(offset) = failed_at else { break };
        let Some(newline) = rest[offset..].find('\n') else {
            break;
        };
        rest = &rest[offset + newline + 1..];
    }

    out
}
