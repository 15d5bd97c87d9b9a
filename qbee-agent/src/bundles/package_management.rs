use super::BundleContext;
use crate::pkg::is_installed;
use crate::util::command::pre_condition_holds;
use anyhow::Result;
use qbee_shared::config::{PackageManagementBundle, RebootMode};

pub(crate) async fn execute(
    bundle: &PackageManagementBundle,
    ctx: &BundleContext<'_>,
) -> Result<()> {
    let pre = ctx.resolve(&bundle.pre_condition).await;
    if !pre_condition_holds(&pre, Some(ctx.remaining())).await? {
        return Ok(());
    }

    let pkg = ctx.service.package_manager();
    if pkg.is_busy().await? {
        ctx.reporter
            .warn("Package manager is busy; postponing package changes");
        return Ok(());
    }

    let mut changed = false;

    if bundle.full_upgrade {
        match pkg.upgrade_all().await {
            Ok(0) => {}
            Ok(count) => {
                changed = true;
                ctx.reporter
                    .info(format!("Successfully upgraded {count} packages"));
            }
            Err(e) => {
                ctx.reporter.err(format!("Full system upgrade failed: {e:#}"));
                return Err(e);
            }
        }
    } else {
        let installed = pkg.list_packages().await?;
        for item in &bundle.items {
            let name = ctx.resolve(&item.name).await;
            let version = ctx.resolve(&item.version).await;
            if name.is_empty() || is_installed(&installed, &name, &version) {
                continue;
            }

            match pkg.install(&name, &version).await {
                Ok(()) => {
                    changed = true;
                    ctx.reporter
                        .info(format!("Successfully installed package {name}"));
                }
                Err(e) => {
                    ctx.reporter
                        .err(format!("Unable to install package {name}: {e:#}"));
                }
            }
        }
    }

    if changed && bundle.reboot_mode == RebootMode::Always {
        ctx.service.reboot_after_run(&ctx.reporter);
    }

    Ok(())
}
