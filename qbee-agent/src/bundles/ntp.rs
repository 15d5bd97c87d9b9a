use super::BundleContext;
use super::software_management::restart_unit;
use anyhow::{Context, Result};
use qbee_shared::config::NtpBundle;
use std::path::Path;

const DROP_IN_DIR: &str = "/etc/systemd/timesyncd.conf.d";
const DROP_IN_FILE: &str = "/etc/systemd/timesyncd.conf.d/qbee-agent.conf";
const TIMESYNC_UNIT: &str = "systemd-timesyncd";

pub(crate) fn render_drop_in(servers: &[String]) -> String {
    format!("[Time]\nNTP={}\n", servers.join(" "))
}

pub(crate) async fn execute(bundle: &NtpBundle, ctx: &BundleContext<'_>) -> Result<()> {
    let mut servers = Vec::with_capacity(bundle.servers.len());
    for server in &bundle.servers {
        let server = ctx.resolve(server).await;
        if !server.is_empty() {
            servers.push(server);
        }
    }

    execute_at(ctx, Path::new(DROP_IN_FILE), &servers).await
}

async fn execute_at(ctx: &BundleContext<'_>, drop_in: &Path, servers: &[String]) -> Result<()> {
    if servers.is_empty() {
        if drop_in.exists() {
            std::fs::remove_file(drop_in)
                .with_context(|| format!("failed to remove {}", drop_in.display()))?;
            restart_unit(ctx, TIMESYNC_UNIT).await;
            ctx.reporter.info("Removed NTP server configuration");
        }
        return Ok(());
    }

    let desired = render_drop_in(servers);
    let current = std::fs::read_to_string(drop_in).unwrap_or_default();
    if current == desired {
        return Ok(());
    }

    let dir = drop_in.parent().unwrap_or(Path::new(DROP_IN_DIR));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    std::fs::write(drop_in, &desired)
        .with_context(|| format!("failed to write {}", drop_in.display()))?;

    restart_unit(ctx, TIMESYNC_UNIT).await;
    ctx.reporter.info("Configured NTP servers");
    Ok(())
}
