use super::BundleContext;
use crate::pkg::is_installed;
use crate::util::command::{CommandError, binary_exists, pre_condition_holds, run_argv};
use anyhow::{Context, Result};
use qbee_shared::config::{SoftwareEntry, SoftwareManagementBundle};
use std::path::Path;

pub(crate) async fn execute(
    bundle: &SoftwareManagementBundle,
    ctx: &BundleContext<'_>,
) -> Result<()> {
    for item in &bundle.items {
        let pre = ctx.resolve(&item.pre_condition).await;
        if !pre_condition_holds(&pre, Some(ctx.remaining())).await? {
            continue;
        }

        if let Err(e) = reconcile_item(item, ctx).await {
            ctx.reporter
                .err(format!("Unable to manage software {}: {e:#}", item.package));
        }
    }
    Ok(())
}

async fn reconcile_item(item: &SoftwareEntry, ctx: &BundleContext<'_>) -> Result<()> {
    let pkg = ctx.service.package_manager();
    let package = ctx.resolve(&item.package).await;
    if package.is_empty() {
        return Ok(());
    }

    let mut changed = false;
    let service_unit;

    if package.ends_with(pkg.file_suffix()) {
        // Package file install: fetch into the software cache first.
        let base = Path::new(&package)
            .file_name()
            .with_context(|| format!("package path {package} has no file name"))?
            .to_string_lossy()
            .into_owned();
        let cached = ctx.files.cache_dir().join("software").join(&base);
        let cached_str = cached.to_string_lossy().into_owned();

        ctx.files
            .download_file(&ctx.reporter, "software_management", &package, &cached_str, None)
            .await?;

        let info = pkg.parse_package_file(&cached).await?;
        let installed = pkg.list_packages().await?;
        if !is_installed(&installed, &info.name, &info.version) {
            pkg.install_local(&cached).await?;

            // Verify the package actually landed.
            let now_installed = pkg.list_packages().await?;
            if !is_installed(&now_installed, &info.name, &info.version) {
                anyhow::bail!("package {} not installed after local install", info.name);
            }
            changed = true;
            ctx.reporter
                .info(format!("Successfully installed package {}", info.name));
        }
        service_unit = if item.service_name.is_empty() {
            info.name
        } else {
            ctx.resolve(&item.service_name).await
        };
    } else {
        let installed = pkg.list_packages().await?;
        if !is_installed(&installed, &package, "") {
            pkg.install(&package, "").await?;
            changed = true;
            ctx.reporter
                .info(format!("Successfully installed package {package}"));
        }
        service_unit = if item.service_name.is_empty() {
            package.clone()
        } else {
            ctx.resolve(&item.service_name).await
        };
    }

    for config in &item.config_files {
        let params = ctx.template_params(&item.parameters).await;
        let created = ctx
            .files
            .download_template_file(
                &ctx.reporter,
                "software_management",
                &config.config_template,
                &config.config_location,
                &params,
            )
            .await?;
        changed = changed || created;
    }

    if changed && !service_unit.is_empty() {
        restart_unit(ctx, &service_unit).await;
    }

    Ok(())
}

/// Restart a systemd unit after a package or config change. Missing
/// systemctl or an unloaded unit is benign; a failed restart is not.
pub(crate) async fn restart_unit(ctx: &BundleContext<'_>, unit: &str) {
    if !binary_exists("systemctl") {
        ctx.reporter.warn(format!(
            "systemctl not found; skipping restart of service {unit}"
        ));
        return;
    }

    let show = run_argv(
        &["systemctl", "show", unit, "--property=LoadState"],
        Some(ctx.remaining()),
    )
    .await;
    match show {
        Ok(output) if output.contains("LoadState=loaded") => {}
        Ok(_) | Err(CommandError::Failed(_)) => {
            ctx.reporter
                .warn(format!("Service {unit} is not loaded; skipping restart"));
            return;
        }
        Err(CommandError::Other(e)) => {
            ctx.reporter
                .err(format!("Unable to query service {unit}: {e:#}"));
            return;
        }
    }

    match run_argv(&["systemctl", "restart", unit], Some(ctx.remaining())).await {
        Ok(_) => ctx
            .reporter
            .info(format!("Successfully restarted service {unit}")),
        Err(e) => {
            let log = e.output_tail().to_string();
            ctx.reporter
                .err_with_log(format!("Unable to restart service {unit}"), log);
        }
    }
}
