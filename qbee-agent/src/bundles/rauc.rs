use super::BundleContext;
use anyhow::{Context, Result, bail};
use crate::util::command::{binary_exists, pre_condition_holds, run_argv};
use qbee_shared::config::RaucBundle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Output of `rauc status --output-format json`, reduced to what the
/// reconciliation needs.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaucStatus {
    #[serde(default)]
    pub compatible: String,
    #[serde(default)]
    pub slots: Vec<HashMap<String, RaucSlot>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaucSlot {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub slot_status: Option<RaucSlotStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaucSlotStatus {
    #[serde(default)]
    pub bundle: Option<RaucSlotBundle>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaucSlotBundle {
    #[serde(default)]
    pub hash: String,
}

impl RaucStatus {
    /// Hash of the bundle installed in the currently booted slot.
    pub fn booted_bundle_hash(&self) -> Option<&str> {
        self.slots
            .iter()
            .flat_map(|slot| slot.values())
            .find(|slot| slot.state == "booted")?
            .slot_status
            .as_ref()?
            .bundle
            .as_ref()
            .map(|bundle| bundle.hash.as_str())
            .filter(|hash| !hash.is_empty())
    }
}

/// Output of `rauc info --output-format json`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RaucBundleInfo {
    #[serde(default)]
    pub compatible: String,
    #[serde(default)]
    pub hash: String,
}

/// Guards against reinstalling a bundle that is installed but not yet
/// booted into. Kept under `<cache>/rauc/state.json`, mode 0600.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct InstallState {
    pub bundle_hash: String,
    pub installed_at: i64,
}

impl InstallState {
    fn path(cache_dir: &Path) -> std::path::PathBuf {
        cache_dir.join("rauc").join("state.json")
    }

    pub fn load(cache_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(cache_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let path = Self::path(cache_dir);
        let dir = path.parent().context("rauc state path has no parent")?;
        std::fs::create_dir_all(dir).context("failed to create rauc state dir")?;

        let content = serde_json::to_string_pretty(self)?;
        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        use std::io::Write;
        let mut file = options.open(&path).context("failed to open rauc state")?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }
}

pub(crate) async fn execute(bundle: &RaucBundle, ctx: &BundleContext<'_>) -> Result<()> {
    if !binary_exists("rauc") {
        ctx.reporter.err("RAUC is not available on this device");
        bail!("rauc not found");
    }

    let pre = ctx.resolve(&bundle.pre_condition).await;
    if !pre_condition_holds(&pre, Some(ctx.remaining())).await? {
        return Ok(());
    }

    let status_raw = run_argv(
        &["rauc", "status", "--output-format", "json"],
        Some(ctx.remaining()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to query RAUC status: {e}"))?;
    let status: RaucStatus =
        serde_json::from_str(&status_raw).context("failed to decode RAUC status")?;

    // Local paths and file:// sources are inspected in place; control-plane
    // paths stream through a signed URL.
    let source = ctx.resolve(&bundle.rauc_bundle).await;
    let bundle_ref = if let Some(local) = source.strip_prefix("file://") {
        local.to_string()
    } else if Path::new(&source).is_absolute() {
        source.clone()
    } else {
        ctx.service
            .signer()
            .sign_url(&source)
            .await
            .context("failed to sign RAUC bundle URL")?
    };

    let info_raw = run_argv(
        &["rauc", "info", "--output-format", "json", bundle_ref.as_str()],
        Some(ctx.remaining()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to read RAUC bundle info: {e}"))?;
    let info: RaucBundleInfo =
        serde_json::from_str(&info_raw).context("failed to decode RAUC bundle info")?;

    if info.compatible != status.compatible {
        ctx.reporter.err(format!(
            "RAUC bundle {} is not compatible with this device ({} != {})",
            source, info.compatible, status.compatible
        ));
        bail!("incompatible RAUC bundle");
    }

    if status.booted_bundle_hash() == Some(info.hash.as_str()) {
        return Ok(());
    }

    // Already installed into the inactive slot, waiting for the reboot.
    let cache_dir = ctx.files.cache_dir().to_path_buf();
    if let Some(state) = InstallState::load(&cache_dir) {
        if state.bundle_hash == info.hash {
            ctx.service.reboot_after_run(&ctx.reporter);
            return Ok(());
        }
    }

    match run_argv(
        &["rauc", "install", bundle_ref.as_str()],
        Some(ctx.remaining()),
    )
    .await
    {
        Ok(_) => {
            InstallState {
                bundle_hash: info.hash.clone(),
                installed_at: chrono::Utc::now().timestamp(),
            }
            .save(&cache_dir)?;
            ctx.reporter
                .info(format!("Successfully installed update bundle {source}"));
            ctx.service.reboot_after_run(&ctx.reporter);
            Ok(())
        }
        Err(e) => {
            ctx.reporter.err_with_log(
                format!("Unable to install update bundle {source}"),
                e.output_tail().to_string(),
            );
            bail!("rauc install failed");
        }
    }
}
