pub(crate) mod compose;
pub(crate) mod containers;
pub(crate) mod file_distribution;
pub(crate) mod firewall;
pub(crate) mod metrics_monitor;
pub(crate) mod ntp;
pub(crate) mod package_management;
pub(crate) mod password;
pub(crate) mod proc_watch;
pub(crate) mod rauc;
pub(crate) mod software_management;
pub(crate) mod sshkeys;
pub(crate) mod users;

use crate::files::FileManager;
use crate::params::{ParameterStore, SystemFacts, expand};
use crate::report::BundleReporter;
use crate::service::Service;
use anyhow::Result;
use self::compose::ComposeRuntime;
use self::containers::ContainerRuntime;
use qbee_shared::config::{self, BundleData, Metadata, Parameter};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Everything an executor may touch during one bundle execution: the
/// per-run reporter scoped to this bundle, the file manager, the parameter
/// store and fact table, and the owning service. Expires with the run
/// deadline.
pub struct BundleContext<'a> {
    pub(crate) service: &'a Service,
    pub(crate) reporter: BundleReporter<'a>,
    pub(crate) files: FileManager<'a>,
    pub(crate) store: &'a ParameterStore,
    pub(crate) facts: &'a SystemFacts,
    started: Instant,
    run_limit: Duration,
}

impl<'a> BundleContext<'a> {
    pub(crate) fn new(
        service: &'a Service,
        reporter: BundleReporter<'a>,
        files: FileManager<'a>,
        store: &'a ParameterStore,
        facts: &'a SystemFacts,
        started: Instant,
        run_limit: Duration,
    ) -> Self {
        Self {
            service,
            reporter,
            files,
            store,
            facts,
            started,
            run_limit,
        }
    }

    /// Time left until the run deadline.
    pub fn remaining(&self) -> Duration {
        self.run_limit.saturating_sub(self.started.elapsed())
    }

    /// Expand `$(key)` tokens against the run's parameter store and facts.
    pub async fn resolve(&self, input: &str) -> String {
        expand(input, self.store, self.facts, self.service.signer(), |w| {
            self.reporter.warn(w)
        })
        .await
    }

    /// Resolve a template-parameter list into a rendering map. Values may
    /// themselves contain `$(key)` tokens.
    pub async fn template_params(&self, params: &[Parameter]) -> HashMap<String, String> {
        let mut map = HashMap::with_capacity(params.len());
        for p in params {
            let value = self.resolve(&p.value).await;
            map.insert(p.key.clone(), value);
        }
        map
    }
}

/// Tagged view over one enabled bundle payload. Dispatch is a name lookup,
/// no reflection. `settings` and `parameters` are consumed out of band by
/// the service and have no executor here.
pub(crate) enum BundleRef<'a> {
    Users(&'a config::UsersBundle),
    SshKeys(&'a config::SshKeysBundle),
    PackageManagement(&'a config::PackageManagementBundle),
    FileDistribution(&'a config::FileDistributionBundle),
    ConnectivityWatchdog(&'a config::ConnectivityWatchdogBundle),
    ProcWatch(&'a config::ProcWatchBundle),
    Ntp(&'a config::NtpBundle),
    SoftwareManagement(&'a config::SoftwareManagementBundle),
    Firewall(&'a config::FirewallBundle),
    Password(&'a config::PasswordBundle),
    DockerContainers(&'a config::ContainersBundle),
    DockerCompose(&'a config::ComposeBundle),
    PodmanContainers(&'a config::ContainersBundle),
    PodmanCompose(&'a config::ComposeBundle),
    Rauc(&'a config::RaucBundle),
    MetricsMonitor(&'a config::MetricsMonitorBundle),
}

impl<'a> BundleRef<'a> {
    pub fn lookup(data: &'a BundleData, name: &str) -> Option<Self> {
        match name {
            config::BUNDLE_USERS => data.users.as_ref().map(BundleRef::Users),
            config::BUNDLE_SSH_KEYS => data.sshkeys.as_ref().map(BundleRef::SshKeys),
            config::BUNDLE_PACKAGE_MANAGEMENT => data
                .package_management
                .as_ref()
                .map(BundleRef::PackageManagement),
            config::BUNDLE_FILE_DISTRIBUTION => data
                .file_distribution
                .as_ref()
                .map(BundleRef::FileDistribution),
            config::BUNDLE_CONNECTIVITY_WATCHDOG => data
                .connectivity_watchdog
                .as_ref()
                .map(BundleRef::ConnectivityWatchdog),
            config::BUNDLE_PROC_WATCH => data.proc_watch.as_ref().map(BundleRef::ProcWatch),
            config::BUNDLE_NTP => data.ntp.as_ref().map(BundleRef::Ntp),
            config::BUNDLE_SOFTWARE_MANAGEMENT => data
                .software_management
                .as_ref()
                .map(BundleRef::SoftwareManagement),
            config::BUNDLE_FIREWALL => data.firewall.as_ref().map(BundleRef::Firewall),
            config::BUNDLE_PASSWORD => data.password.as_ref().map(BundleRef::Password),
            config::BUNDLE_DOCKER_CONTAINERS => data
                .docker_containers
                .as_ref()
                .map(BundleRef::DockerContainers),
            config::BUNDLE_DOCKER_COMPOSE => {
                data.docker_compose.as_ref().map(BundleRef::DockerCompose)
            }
            config::BUNDLE_PODMAN_CONTAINERS => data
                .podman_containers
                .as_ref()
                .map(BundleRef::PodmanContainers),
            config::BUNDLE_PODMAN_COMPOSE => {
                data.podman_compose.as_ref().map(BundleRef::PodmanCompose)
            }
            config::BUNDLE_RAUC => data.rauc.as_ref().map(BundleRef::Rauc),
            config::BUNDLE_METRICS_MONITOR => {
                data.metrics_monitor.as_ref().map(BundleRef::MetricsMonitor)
            }
            _ => None,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            BundleRef::Users(b) => &b.metadata,
            BundleRef::SshKeys(b) => &b.metadata,
            BundleRef::PackageManagement(b) => &b.metadata,
            BundleRef::FileDistribution(b) => &b.metadata,
            BundleRef::ConnectivityWatchdog(b) => &b.metadata,
            BundleRef::ProcWatch(b) => &b.metadata,
            BundleRef::Ntp(b) => &b.metadata,
            BundleRef::SoftwareManagement(b) => &b.metadata,
            BundleRef::Firewall(b) => &b.metadata,
            BundleRef::Password(b) => &b.metadata,
            BundleRef::DockerContainers(b) => &b.metadata,
            BundleRef::DockerCompose(b) => &b.metadata,
            BundleRef::PodmanContainers(b) => &b.metadata,
            BundleRef::PodmanCompose(b) => &b.metadata,
            BundleRef::Rauc(b) => &b.metadata,
            BundleRef::MetricsMonitor(b) => &b.metadata,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.metadata().enabled
    }

    pub fn bundle_commit_id(&self) -> &str {
        &self.metadata().bundle_commit_id
    }

    pub async fn execute(&self, ctx: &BundleContext<'_>) -> Result<()> {
        match self {
            BundleRef::Users(b) => users::execute(b, ctx).await,
            BundleRef::SshKeys(b) => sshkeys::execute(b, ctx).await,
            BundleRef::PackageManagement(b) => package_management::execute(b, ctx).await,
            BundleRef::FileDistribution(b) => file_distribution::execute(b, ctx).await,
            BundleRef::ConnectivityWatchdog(b) => connectivity_watchdog_execute(b, ctx),
            BundleRef::ProcWatch(b) => proc_watch::execute(b, ctx).await,
            BundleRef::Ntp(b) => ntp::execute(b, ctx).await,
            BundleRef::SoftwareManagement(b) => software_management::execute(b, ctx).await,
            BundleRef::Firewall(b) => firewall::execute(b, ctx).await,
            BundleRef::Password(b) => password::execute(b, ctx).await,
            BundleRef::DockerContainers(b) => {
                containers::execute(b, ctx, ContainerRuntime::Docker).await
            }
            BundleRef::DockerCompose(b) => compose::execute(b, ctx, ComposeRuntime::Docker).await,
            BundleRef::PodmanContainers(b) => {
                containers::execute(b, ctx, ContainerRuntime::Podman).await
            }
            BundleRef::PodmanCompose(b) => compose::execute(b, ctx, ComposeRuntime::Podman).await,
            BundleRef::Rauc(b) => rauc::execute(b, ctx).await,
            BundleRef::MetricsMonitor(b) => metrics_monitor::execute(b, ctx).await,
        }
    }
}

/// The watchdog bundle only carries a number; small enough to live here.
fn connectivity_watchdog_execute(
    bundle: &qbee_shared::config::ConnectivityWatchdogBundle,
    ctx: &BundleContext<'_>,
) -> Result<()> {
    let threshold: u32 = match bundle.threshold.trim().parse() {
        Ok(threshold) => threshold,
        Err(_) => {
            ctx.reporter.err(format!(
                "Invalid connectivity watchdog threshold: {:?}",
                bundle.threshold
            ));
            anyhow::bail!("invalid watchdog threshold {:?}", bundle.threshold);
        }
    };
    ctx.service.set_watchdog_threshold(threshold);
    Ok(())
}
