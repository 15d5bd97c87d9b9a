use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bundle names as they appear in `CommittedConfig.bundles` and in report
/// records. The order of execution is whatever the control plane committed,
/// not the order listed here.
pub const BUNDLE_SETTINGS: &str = "settings";
pub const BUNDLE_PARAMETERS: &str = "parameters";
pub const BUNDLE_USERS: &str = "users";
pub const BUNDLE_SSH_KEYS: &str = "sshkeys";
pub const BUNDLE_PACKAGE_MANAGEMENT: &str = "package_management";
pub const BUNDLE_FILE_DISTRIBUTION: &str = "file_distribution";
pub const BUNDLE_CONNECTIVITY_WATCHDOG: &str = "connectivity_watchdog";
pub const BUNDLE_PROC_WATCH: &str = "proc_watch";
pub const BUNDLE_NTP: &str = "ntp";
pub const BUNDLE_SOFTWARE_MANAGEMENT: &str = "software_management";
pub const BUNDLE_FIREWALL: &str = "firewall";
pub const BUNDLE_PASSWORD: &str = "password";
pub const BUNDLE_DOCKER_CONTAINERS: &str = "docker_containers";
pub const BUNDLE_DOCKER_COMPOSE: &str = "docker_compose";
pub const BUNDLE_PODMAN_CONTAINERS: &str = "podman_containers";
pub const BUNDLE_PODMAN_COMPOSE: &str = "podman_compose";
pub const BUNDLE_RAUC: &str = "rauc";
pub const BUNDLE_METRICS_MONITOR: &str = "metrics_monitor";

/// Desired state as committed in the control plane. A bundle is acted on
/// only when its name is listed in `bundles` AND its payload is enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommittedConfig {
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub bundles: Vec<String>,
    #[serde(default)]
    pub bundle_data: BundleData,
}

impl CommittedConfig {
    /// True when `name` is both listed and carries an enabled payload.
    pub fn is_bundle_active(&self, name: &str) -> bool {
        self.bundles.iter().any(|b| b == name)
            && self
                .bundle_data
                .metadata_of(name)
                .is_some_and(|m| m.enabled)
    }

    /// The parameters payload, but only when listed and enabled.
    pub fn active_parameters(&self) -> Option<&ParametersBundle> {
        if self.is_bundle_active(BUNDLE_PARAMETERS) {
            self.bundle_data.parameters.as_ref()
        } else {
            None
        }
    }

    /// The settings payload, but only when listed and enabled.
    pub fn active_settings(&self) -> Option<&SettingsBundle> {
        if self.is_bundle_active(BUNDLE_SETTINGS) {
            self.bundle_data.settings.as_ref()
        } else {
            None
        }
    }
}

/// Per-bundle payloads keyed by bundle name in the wire format. Absent keys
/// decode to `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParametersBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<UsersBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<SshKeysBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_management: Option<PackageManagementBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_distribution: Option<FileDistributionBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity_watchdog: Option<ConnectivityWatchdogBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_watch: Option<ProcWatchBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp: Option<NtpBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_management: Option<SoftwareManagementBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_containers: Option<ContainersBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_compose: Option<ComposeBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podman_containers: Option<ContainersBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podman_compose: Option<ComposeBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rauc: Option<RaucBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_monitor: Option<MetricsMonitorBundle>,
}

impl BundleData {
    pub fn metadata_of(&self, name: &str) -> Option<&Metadata> {
        match name {
            BUNDLE_SETTINGS => self.settings.as_ref().map(|b| &b.metadata),
            BUNDLE_PARAMETERS => self.parameters.as_ref().map(|b| &b.metadata),
            BUNDLE_USERS => self.users.as_ref().map(|b| &b.metadata),
            BUNDLE_SSH_KEYS => self.sshkeys.as_ref().map(|b| &b.metadata),
            BUNDLE_PACKAGE_MANAGEMENT => self.package_management.as_ref().map(|b| &b.metadata),
            BUNDLE_FILE_DISTRIBUTION => self.file_distribution.as_ref().map(|b| &b.metadata),
            BUNDLE_CONNECTIVITY_WATCHDOG => {
                self.connectivity_watchdog.as_ref().map(|b| &b.metadata)
            }
            BUNDLE_PROC_WATCH => self.proc_watch.as_ref().map(|b| &b.metadata),
            BUNDLE_NTP => self.ntp.as_ref().map(|b| &b.metadata),
            BUNDLE_SOFTWARE_MANAGEMENT => self.software_management.as_ref().map(|b| &b.metadata),
            BUNDLE_FIREWALL => self.firewall.as_ref().map(|b| &b.metadata),
            BUNDLE_PASSWORD => self.password.as_ref().map(|b| &b.metadata),
            BUNDLE_DOCKER_CONTAINERS => self.docker_containers.as_ref().map(|b| &b.metadata),
            BUNDLE_DOCKER_COMPOSE => self.docker_compose.as_ref().map(|b| &b.metadata),
            BUNDLE_PODMAN_CONTAINERS => self.podman_containers.as_ref().map(|b| &b.metadata),
            BUNDLE_PODMAN_COMPOSE => self.podman_compose.as_ref().map(|b| &b.metadata),
            BUNDLE_RAUC => self.rauc.as_ref().map(|b| &b.metadata),
            BUNDLE_METRICS_MONITOR => self.metrics_monitor.as_ref().map(|b| &b.metadata),
            _ => None,
        }
    }
}

/// Common envelope carried by every bundle payload. `bundle_commit_id`
/// flows into every report emitted while that bundle runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub bundle_commit_id: String,
}

/// One `key=value` entry in a parameter or template mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

fn default_run_interval() -> i64 {
    5 // minutes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub metrics: bool,
    #[serde(default)]
    pub reports: bool,
    #[serde(default)]
    pub software_inventory: bool,
    #[serde(default)]
    pub process_inventory: bool,
    /// Minutes between reconciliation runs.
    #[serde(default = "default_run_interval")]
    pub run_interval: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParametersBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Secret values feed the report redaction list in addition to the
    /// parameter store.
    #[serde(default)]
    pub secrets: Vec<Parameter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub action: UserAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: Vec<UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyEntry {
    pub username: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKeysBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub users: Vec<SshKeyEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootMode {
    #[default]
    Never,
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageEntry {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageManagementBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub pre_condition: String,
    #[serde(default)]
    pub items: Vec<PackageEntry>,
    #[serde(default)]
    pub reboot_mode: RebootMode,
    #[serde(default)]
    pub full_upgrade: bool,
}

/// A single file managed by the file_distribution bundle. The wire key for
/// the per-set file list is `templates` for historical reasons; plain
/// downloads live there too with `is_template == false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileEntry {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub pre_condition: String,
    #[serde(default)]
    pub templates: Vec<FileEntry>,
    #[serde(default)]
    pub after_command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDistributionBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub files: Vec<FileSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityWatchdogBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    /// Consecutive-connection-failure count that arms a reboot. String in
    /// the wire format; parsed by the executor.
    #[serde(default)]
    pub threshold: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessPolicy {
    Present,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWatcher {
    pub name: String,
    pub policy: ProcessPolicy,
    /// Start command for `Present`, stop command for `Absent`.
    #[serde(default)]
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcWatchBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub processes: Vec<ProcessWatcher>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NtpBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFileEntry {
    pub config_template: String,
    pub config_location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareEntry {
    pub package: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub pre_condition: String,
    #[serde(default)]
    pub config_files: Vec<ConfigFileEntry>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareManagementBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: Vec<SoftwareEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FirewallRule {
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub src_ip: String,
    #[serde(default)]
    pub dst_port: String,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallChain {
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    /// table name -> chain name -> desired chain state.
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeMap<String, FirewallChain>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPassword {
    pub username: String,
    pub passwordhash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PasswordBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub users: Vec<UserPassword>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    /// Extra run arguments; the wire key differs per runtime.
    #[serde(default, alias = "docker_args", alias = "podman_args")]
    pub args: String,
    #[serde(default)]
    pub env_file: String,
    /// Leave a stopped or outdated container alone instead of recreating it.
    #[serde(default)]
    pub skip_restart: bool,
}

/// Payload shape shared by docker_containers and podman_containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainersBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub registry_auths: Vec<RegistryAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeProject {
    pub name: String,
    #[serde(default)]
    pub pre_condition: String,
    /// Source of the compose file.
    pub file: String,
    #[serde(default)]
    pub file_is_template: bool,
    #[serde(default)]
    pub file_parameters: Vec<Parameter>,
    /// Optional source of a build-context tarball.
    #[serde(default)]
    pub context: String,
    /// Pass --no-force-recreate instead of --force-recreate on `up`.
    #[serde(default)]
    pub skip_recreate: bool,
}

/// Payload shape shared by docker_compose and podman_compose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub projects: Vec<ComposeProject>,
    /// Tear down cached projects that are no longer configured.
    #[serde(default)]
    pub clean: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaucBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub pre_condition: String,
    /// Local path or control-plane path of the RAUC bundle.
    pub rauc_bundle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricMonitor {
    /// Metric label, e.g. `cpu:user` or `filesystem:use`.
    pub value: String,
    /// Distinguishes multiple instances of the same metric (mount point,
    /// interface name). May be empty.
    #[serde(default)]
    pub id: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsMonitorBundle {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub metrics: Vec<MetricMonitor>,
}
