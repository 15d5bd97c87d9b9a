use super::BundleContext;
use crate::util::command::{CommandError, binary_exists, run_argv};
use anyhow::{Context, Result};
use qbee_shared::config::{UserAction, UsersBundle};
use std::path::Path;

/// One account from the system user database.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

pub(crate) fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 || fields[0].is_empty() {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

pub(crate) fn read_passwd() -> Result<Vec<PasswdEntry>> {
    let content =
        std::fs::read_to_string("/etc/passwd").context("failed to read user database")?;
    Ok(parse_passwd(&content))
}

fn login_shell() -> &'static str {
    for shell in ["/bin/bash", "/usr/bin/bash", "/bin/sh"] {
        if Path::new(shell).exists() {
            return shell;
        }
    }
    "/bin/sh"
}

pub(crate) async fn execute(bundle: &UsersBundle, ctx: &BundleContext<'_>) -> Result<()> {
    let existing = read_passwd()?;

    for item in &bundle.items {
        let username = ctx.resolve(&item.username).await;
        if username.is_empty() {
            continue;
        }
        let present = existing.iter().any(|u| u.name == username);

        match item.action {
            UserAction::Add => {
                if present {
                    continue;
                }
                let argv = [
                    "useradd",
                    "--create-home",
                    "--shell",
                    login_shell(),
                    username.as_str(),
                ];
                match run_argv(&argv, Some(ctx.remaining())).await {
                    Ok(_) => ctx
                        .reporter
                        .info(format!("Successfully added user {username}")),
                    Err(e) => {
                        let log = e.output_tail().to_string();
                        ctx.reporter
                            .err_with_log(format!("Unable to add user {username}"), log);
                    }
                }
            }
            UserAction::Remove => {
                if username == "root" {
                    ctx.reporter.warn("Refusing to remove the root user");
                    continue;
                }
                if !present {
                    continue;
                }
                if !binary_exists("userdel") {
                    ctx.reporter
                        .err(format!("Unable to remove user {username}: userdel not found"));
                    continue;
                }
                match run_argv(
                    &["userdel", "--remove", username.as_str()],
                    Some(ctx.remaining()),
                )
                .await
                {
                    Ok(_) => ctx
                        .reporter
                        .info(format!("Successfully removed user {username}")),
                    Err(e) => {
                        let log = match &e {
                            CommandError::Failed(f) => f.output_tail.clone(),
                            CommandError::Other(_) => String::new(),
                        };
                        ctx.reporter
                            .err_with_log(format!("Unable to remove user {username}"), log);
                    }
                }
            }
        }
    }

    Ok(())
}
