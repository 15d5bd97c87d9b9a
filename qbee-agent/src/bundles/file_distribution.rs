use super::BundleContext;
use crate::files::resolve_destination_path;
use crate::util::command::{CommandError, pre_condition_holds, run_shell};
use anyhow::Result;
use qbee_shared::config::FileDistributionBundle;
use std::time::Duration;

/// Deadline for a file set's after-command.
const AFTER_COMMAND_LIMIT: Duration = Duration::from_secs(30 * 60);

pub(crate) async fn execute(
    bundle: &FileDistributionBundle,
    ctx: &BundleContext<'_>,
) -> Result<()> {
    for set in &bundle.files {
        let pre = ctx.resolve(&set.pre_condition).await;
        if !pre_condition_holds(&pre, Some(ctx.remaining())).await? {
            continue;
        }

        let mut changed = false;
        for file in &set.templates {
            let source = ctx.resolve(&file.source).await;
            let destination = ctx.resolve(&file.destination).await;
            let destination = match resolve_destination_path(&source, &destination) {
                Ok(destination) => destination,
                Err(e) => {
                    ctx.reporter
                        .err(format!("Invalid destination for {source}: {e:#}"));
                    continue;
                }
            };

            let created = if file.is_template {
                let params = ctx.template_params(&file.parameters).await;
                ctx.files
                    .download_template_file(&ctx.reporter, "file_distribution", &source, &destination, &params)
                    .await
            } else {
                ctx.files
                    .download_file(&ctx.reporter, "file_distribution", &source, &destination, None)
                    .await
            };

            match created {
                Ok(created) => changed = changed || created,
                Err(e) => {
                    ctx.reporter
                        .err(format!("Unable to distribute file {source}: {e:#}"));
                }
            }
        }

        if changed && !set.after_command.trim().is_empty() {
            let command = ctx.resolve(&set.after_command).await;
            let limit = AFTER_COMMAND_LIMIT.min(ctx.remaining());
            match run_shell(&command, Some(limit)).await {
                Ok(_) => {
                    ctx.reporter
                        .info(format!("Successfully executed after command: {command}"));
                }
                Err(e) => {
                    let log = match &e {
                        CommandError::Failed(f) => f.output_tail.clone(),
                        CommandError::Other(_) => String::new(),
                    };
                    ctx.reporter
                        .err_with_log(format!("After command failed: {command}"), log);
                }
            }
        }
    }

    Ok(())
}
