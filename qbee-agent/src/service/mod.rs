pub mod lock;
pub mod watchdog;

use crate::api::{ApiError, Client, UrlSigner, is_connection_error};
use crate::bundles::{BundleContext, BundleRef};
use crate::config::AgentConfig;
use crate::files::FileManager;
use crate::metrics::MetricsSource;
use crate::params::{ParameterStore, SystemFacts};
use crate::pkg::PackageManager;
use crate::report::buffer::ReportBuffer;
use crate::report::{BundleReporter, Reporter, standalone_report};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use self::lock::{ExecuteLock, LockState};
use self::watchdog::ConnectivityWatchdog;
use qbee_shared::config::{
    BUNDLE_CONNECTIVITY_WATCHDOG, BUNDLE_PARAMETERS, BUNDLE_SETTINGS, CommittedConfig,
    SettingsBundle,
};
use qbee_shared::report::{Report, Severity};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Hard ceiling on a single reconciliation run; also the age at which a
/// foreign lock file is considered stale.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reports are delivered in batches of at most this many records.
const REPORT_BATCH_SIZE: usize = 100;

/// First-run config fetch: bounded retries with randomised backoff.
const BOOTSTRAP_ATTEMPTS: u32 = 30;
const BOOTSTRAP_BACKOFF_SECS: std::ops::RangeInclusive<u64> = 6..=10;

const CONFIG_CACHE_FILE: &str = "config.json";

/// Device-side settings applied from the settings bundle, or these defaults
/// when the bundle is absent or disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub reports_enabled: bool,
    pub metrics_enabled: bool,
    pub software_inventory_enabled: bool,
    pub process_inventory_enabled: bool,
    pub run_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reports_enabled: true,
            metrics_enabled: true,
            software_inventory_enabled: true,
            process_inventory_enabled: false,
            run_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Settings {
    fn from_bundle(bundle: &SettingsBundle) -> Self {
        let default_interval = Settings::default().run_interval;
        Self {
            reports_enabled: bundle.reports,
            metrics_enabled: bundle.metrics,
            software_inventory_enabled: bundle.software_inventory,
            process_inventory_enabled: bundle.process_inventory,
            run_interval: if bundle.run_interval > 0 {
                Duration::from_secs(bundle.run_interval as u64 * 60)
            } else {
                default_interval
            },
        }
    }
}

/// Top-level reconciliation orchestrator. Owns all long-lived state; each
/// run gets its own reporter, parameter store and fact table.
pub struct Service {
    api: Client,
    app_dir: PathBuf,
    cache_dir: PathBuf,
    lock_file: PathBuf,
    console_reporting: bool,
    pkg: Box<dyn PackageManager>,
    metrics: Box<dyn MetricsSource>,
    buffer: ReportBuffer,
    settings: Mutex<Settings>,
    interval_tx: watch::Sender<Duration>,
    watchdog: Mutex<ConnectivityWatchdog>,
    reboot_armed: AtomicBool,
    current_commit_id: Mutex<String>,
    config_changed_at: Mutex<Option<DateTime<Utc>>>,
    monitor_trips: Mutex<HashMap<String, f64>>,
}

impl Service {
    pub fn new(
        config: &AgentConfig,
        api: Client,
        pkg: Box<dyn PackageManager>,
        metrics: Box<dyn MetricsSource>,
    ) -> Result<Self> {
        create_private_dir(&config.app_dir, 0o700)?;
        create_private_dir(&config.cache_dir, 0o750)?;

        let (interval_tx, _) = watch::channel(Settings::default().run_interval);

        Ok(Self {
            api,
            app_dir: config.app_dir.clone(),
            cache_dir: config.cache_dir.clone(),
            lock_file: lock::lock_path(&config.app_dir),
            console_reporting: config.console_reporting,
            pkg,
            metrics,
            buffer: ReportBuffer::new(&config.app_dir),
            settings: Mutex::new(Settings::default()),
            interval_tx,
            watchdog: Mutex::new(ConnectivityWatchdog::default()),
            reboot_armed: AtomicBool::new(false),
            current_commit_id: Mutex::new(String::new()),
            config_changed_at: Mutex::new(None),
            monitor_trips: Mutex::new(HashMap::new()),
        })
    }

    /// Relocate the run lock, e.g. for embedders that manage their own
    /// runtime directory.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = path.into();
        self
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub(crate) fn signer(&self) -> &dyn UrlSigner {
        &self.api
    }

    pub(crate) fn package_manager(&self) -> &dyn PackageManager {
        self.pkg.as_ref()
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSource {
        self.metrics.as_ref()
    }

    pub(crate) fn monitor_state(&self) -> &Mutex<HashMap<String, f64>> {
        &self.monitor_trips
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().expect("settings lock poisoned").clone()
    }

    /// Commit id of the last successfully applied configuration.
    pub fn current_commit_id(&self) -> String {
        self.current_commit_id
            .lock()
            .expect("commit id lock poisoned")
            .clone()
    }

    pub fn config_changed_at(&self) -> Option<DateTime<Utc>> {
        *self
            .config_changed_at
            .lock()
            .expect("change time lock poisoned")
    }

    /// Observe run-interval changes pushed by `update_settings`. A slow
    /// consumer simply sees the latest value.
    pub fn run_interval_updates(&self) -> watch::Receiver<Duration> {
        self.interval_tx.subscribe()
    }

    pub fn should_reboot(&self) -> bool {
        self.reboot_armed.load(Ordering::SeqCst)
    }

    /// Arm a reboot once the run finishes. The warning is emitted only when
    /// the flag flips.
    pub(crate) fn reboot_after_run(&self, reporter: &BundleReporter<'_>) {
        if !self.reboot_armed.swap(true, Ordering::SeqCst) {
            reporter.warn("Scheduling system reboot.");
        }
    }

    pub(crate) fn set_watchdog_threshold(&self, threshold: u32) {
        self.watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .set_threshold(threshold);
    }

    /// Feed one API outcome to the connectivity watchdog; when the failure
    /// budget is exhausted, arm a reboot and put the warning straight into
    /// the on-disk buffer (the control plane is unreachable by definition).
    fn note_api_outcome(&self, connection_error: bool) {
        let exhausted = self
            .watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .note(connection_error);
        if exhausted && !self.reboot_armed.swap(true, Ordering::SeqCst) {
            tracing::warn!("connectivity watchdog triggered; scheduling reboot");
            let report = standalone_report(
                &self.current_commit_id(),
                BUNDLE_CONNECTIVITY_WATCHDOG,
                Severity::Warn,
                "Scheduling system reboot.",
            );
            if let Err(e) = self.buffer.append(&[report]) {
                tracing::error!("failed to buffer watchdog report: {e:#}");
            }
        }
    }

    /// Fetch the committed configuration. A fetch that succeeds is
    /// persisted; a fetch that fails falls back to the persisted cache. On
    /// a brand-new device with no cache, connection errors are retried with
    /// randomised backoff before giving up.
    pub async fn get(&self) -> Result<CommittedConfig> {
        let mut attempt = 0;
        loop {
            let error = match self.api.get_config().await {
                Ok(config) => {
                    self.note_api_outcome(false);
                    if let Err(e) = self.persist_config_cache(&config) {
                        tracing::warn!("failed to persist config cache: {e:#}");
                    }
                    return Ok(config);
                }
                Err(error) => error,
            };

            self.note_api_outcome(error.is_connection());

            if let Some(cached) = self.cached_config()? {
                tracing::warn!("unable to fetch configuration ({error}); using cached copy");
                return Ok(cached);
            }

            if !error.is_connection() || attempt >= BOOTSTRAP_ATTEMPTS {
                return Err(anyhow::Error::new(error).context("failed to fetch configuration"));
            }
            attempt += 1;
            let backoff = rand::thread_rng().gen_range(BOOTSTRAP_BACKOFF_SECS);
            tracing::warn!("configuration fetch failed; retrying in {backoff}s ({error})");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }
    }

    fn config_cache_path(&self) -> PathBuf {
        self.app_dir.join(CONFIG_CACHE_FILE)
    }

    fn persist_config_cache(&self, config: &CommittedConfig) -> Result<()> {
        use std::io::Write;

        let path = self.config_cache_path();
        let tmp = path.with_extension("json.tmp");
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
            let content =
                serde_json::to_string_pretty(config).context("failed to encode config cache")?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path).context("failed to replace config cache")?;
        Ok(())
    }

    fn cached_config(&self) -> Result<Option<CommittedConfig>> {
        let path = self.config_cache_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        Ok(Some(config))
    }

    /// Apply the settings bundle, or the built-in defaults when it is
    /// absent or disabled. A changed run interval is pushed to the outer
    /// scheduler.
    pub fn update_settings(&self, config: &CommittedConfig) {
        let new = config
            .active_settings()
            .map(Settings::from_bundle)
            .unwrap_or_default();

        let mut current = self.settings.lock().expect("settings lock poisoned");
        if new.run_interval != current.run_interval {
            tracing::info!(
                "run interval changed to {} seconds",
                new.run_interval.as_secs()
            );
            self.interval_tx.send_replace(new.run_interval);
        }
        *current = new;
    }

    /// One reconciliation pass over `config`, under the cross-process lock
    /// and the hard run deadline.
    pub async fn execute(&self, config: &CommittedConfig) -> Result<()> {
        let started = Instant::now();

        let _lock = match ExecuteLock::acquire(&self.lock_file, RUN_TIMEOUT)? {
            LockState::Acquired(lock) => lock,
            LockState::Busy => {
                tracing::info!("another process is running configuration");
                return Ok(());
            }
        };

        if !config.is_bundle_active(BUNDLE_CONNECTIVITY_WATCHDOG) {
            self.watchdog
                .lock()
                .expect("watchdog lock poisoned")
                .disable();
        }

        let store = ParameterStore::from_bundle(config.active_parameters());
        let reporter = Reporter::new(
            &config.commit_id,
            self.console_reporting,
            store.secret_values().to_vec(),
        );
        let pkg_arch = self.pkg.package_architecture().await.unwrap_or_default();
        let facts = SystemFacts::collect(self.pkg.pkg_type(), &pkg_arch);

        // Name of the bundle in flight, for the cancellation report.
        let current_bundle = Mutex::new((String::new(), String::new()));

        let run = self.run_bundles(config, &reporter, &store, &facts, started, &current_bundle);
        if tokio::time::timeout(RUN_TIMEOUT, run).await.is_err() {
            let (bundle, bundle_commit_id) = current_bundle
                .lock()
                .expect("bundle tracker poisoned")
                .clone();
            reporter
                .bundle(&bundle, &bundle_commit_id)
                .err("Bundle execution cancelled by the run deadline");
            tracing::error!(
                "configuration run exceeded {} seconds",
                RUN_TIMEOUT.as_secs()
            );
        }

        {
            let mut current = self.current_commit_id.lock().expect("commit id poisoned");
            if *current != config.commit_id {
                *current = config.commit_id.clone();
                *self
                    .config_changed_at
                    .lock()
                    .expect("change time poisoned") = Some(Utc::now());
            }
        }

        if !self.settings().reports_enabled {
            return Ok(());
        }
        self.deliver_reports(reporter.reports()).await
    }

    async fn run_bundles(
        &self,
        config: &CommittedConfig,
        reporter: &Reporter,
        store: &ParameterStore,
        facts: &SystemFacts,
        started: Instant,
        current_bundle: &Mutex<(String, String)>,
    ) {
        for name in &config.bundles {
            // Settings and parameters are consumed out of band.
            if name == BUNDLE_SETTINGS || name == BUNDLE_PARAMETERS {
                continue;
            }

            let Some(bundle) = BundleRef::lookup(&config.bundle_data, name) else {
                tracing::warn!("bundle {name} is listed but carries no payload");
                continue;
            };
            if !bundle.is_enabled() {
                continue;
            }

            *current_bundle.lock().expect("bundle tracker poisoned") =
                (name.clone(), bundle.bundle_commit_id().to_string());

            let ctx = BundleContext::new(
                self,
                reporter.bundle(name, bundle.bundle_commit_id()),
                FileManager::new(&self.api, &self.api, store, facts, self.cache_dir.clone()),
                store,
                facts,
                started,
                RUN_TIMEOUT,
            );

            // Per-bundle fault isolation: a failing bundle never aborts the
            // run. Connection errors stay out of the report stream; the
            // watchdog already tracks them.
            if let Err(e) = bundle.execute(&ctx).await {
                if is_connection_error(&e) {
                    tracing::error!("bundle {name} failed: control plane unreachable: {e:#}");
                } else {
                    tracing::error!("bundle {name} failed: {e:#}");
                }
            }

            if started.elapsed() >= RUN_TIMEOUT {
                break;
            }
        }
    }

    /// Deliver this run's reports, falling back to the on-disk buffer; on
    /// full success, also try to drain the buffered backlog.
    async fn deliver_reports(&self, reports: Vec<Report>) -> Result<()> {
        let (delivered, result) = self.send_reports(&reports).await;

        match result {
            Ok(()) => {
                if let Err(e) = self.flush_buffer().await {
                    tracing::warn!("failed to flush report buffer: {e:#}");
                }
                Ok(())
            }
            Err(error) => {
                let undelivered = &reports[delivered..];
                self.buffer
                    .append(undelivered)
                    .context("failed to buffer undelivered reports")?;
                Err(anyhow::Error::new(error).context("failed to deliver reports"))
            }
        }
    }

    /// Send reports in order, at most `REPORT_BATCH_SIZE` per request.
    /// Stops on the first error and returns the partial delivery count.
    async fn send_reports(&self, reports: &[Report]) -> (usize, Result<(), ApiError>) {
        let mut delivered = 0;
        for batch in reports.chunks(REPORT_BATCH_SIZE) {
            match self.api.post_reports(batch).await {
                Ok(()) => {
                    self.note_api_outcome(false);
                    delivered += batch.len();
                }
                Err(error) => {
                    self.note_api_outcome(error.is_connection());
                    return (delivered, Err(error));
                }
            }
        }
        (delivered, Ok(()))
    }

    async fn flush_buffer(&self) -> Result<()> {
        let buffered = self.buffer.read()?;
        if buffered.is_empty() {
            // Nothing left but possibly an expired-only file.
            self.buffer.clear()?;
            return Ok(());
        }

        let (delivered, result) = self.send_reports(&buffered).await;
        if delivered == buffered.len() {
            self.buffer.clear()?;
        } else if delivered > 0 {
            self.buffer.rewrite(&buffered[delivered..])?;
        }
        result.map_err(|e| anyhow::Error::new(e).context("failed to flush buffered reports"))
    }
}

fn create_private_dir(dir: &Path, mode: u32) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder
        .create(dir)
        .with_context(|| format!("failed to create {}", dir.display()))
}
