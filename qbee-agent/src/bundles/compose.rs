use super::BundleContext;
use crate::util::command::{CommandError, pre_condition_holds, run_shell};
use anyhow::{Context, Result};
use qbee_shared::config::{ComposeBundle, ComposeProject};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComposeRuntime {
    Docker,
    Podman,
}

impl ComposeRuntime {
    pub fn cli(self) -> &'static str {
        match self {
            ComposeRuntime::Docker => "docker",
            ComposeRuntime::Podman => "podman",
        }
    }

    /// Projects are cached per runtime; the clean pass only ever touches
    /// its own runtime's directory.
    pub fn cache_subdir(self) -> &'static str {
        match self {
            ComposeRuntime::Docker => "docker_compose",
            ComposeRuntime::Podman => "podman_compose",
        }
    }
}

/// Remembers which build-context tarball was last unpacked for a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct ContextState {
    pub source: String,
    pub sha256: String,
}

impl ContextState {
    fn path(project_dir: &Path) -> PathBuf {
        project_dir.join("context-metadata.json")
    }

    pub fn load(project_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(project_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(project_dir), content)
            .context("failed to write context state")?;
        Ok(())
    }
}

pub(crate) fn up_command(
    runtime: ComposeRuntime,
    project: &str,
    compose_file: &str,
    skip_recreate: bool,
) -> String {
    let recreate = if skip_recreate {
        "--no-force-recreate"
    } else {
        "--force-recreate"
    };
    format!(
        "{} compose -p {project} -f {compose_file} up -d --wait {recreate}",
        runtime.cli()
    )
}

pub(crate) fn down_command(runtime: ComposeRuntime, project: &str, compose_file: &str) -> String {
    format!(
        "{} compose -p {project} -f {compose_file} down --volumes --rmi all",
        runtime.cli()
    )
}

pub(crate) async fn execute(
    bundle: &ComposeBundle,
    ctx: &BundleContext<'_>,
    runtime: ComposeRuntime,
) -> Result<()> {
    let compose_root = ctx.files.cache_dir().join(runtime.cache_subdir());
    let mut configured = HashSet::new();

    for project in &bundle.projects {
        let name = ctx.resolve(&project.name).await;
        if name.is_empty() {
            continue;
        }
        configured.insert(name.clone());

        let pre = ctx.resolve(&project.pre_condition).await;
        if !pre_condition_holds(&pre, Some(ctx.remaining())).await? {
            continue;
        }

        if let Err(e) = reconcile_project(project, &name, &compose_root, ctx, runtime).await {
            ctx.reporter
                .err(format!("Unable to deploy compose project {name}: {e:#}"));
        }
    }

    if bundle.clean {
        clean_projects(&compose_root, &configured, ctx, runtime).await;
    }

    Ok(())
}

async fn reconcile_project(
    project: &ComposeProject,
    name: &str,
    compose_root: &Path,
    ctx: &BundleContext<'_>,
    runtime: ComposeRuntime,
) -> Result<()> {
    let project_dir = compose_root.join(name);
    let compose_file = project_dir.join("compose.yml");
    let compose_file_str = compose_file.to_string_lossy().into_owned();

    let mut changed = !compose_file.exists();

    let created = if project.file_is_template {
        let params = ctx.template_params(&project.file_parameters).await;
        ctx.files
            .download_template_file(&ctx.reporter, "compose", &project.file, &compose_file_str, &params)
            .await?
    } else {
        ctx.files
            .download_file(&ctx.reporter, "compose", &project.file, &compose_file_str, None)
            .await?
    };
    changed = changed || created;

    if !project.context.is_empty() {
        changed = fetch_context(project, &project_dir, ctx).await? || changed;
    }

    if !changed {
        return Ok(());
    }

    let command = up_command(runtime, name, &compose_file_str, project.skip_recreate);
    match run_shell(&command, Some(ctx.remaining())).await {
        Ok(_) => {
            ctx.reporter
                .info(format!("Successfully deployed compose project {name}"));
            Ok(())
        }
        Err(e) => {
            let log = match &e {
                CommandError::Failed(f) => f.output_tail.clone(),
                CommandError::Other(_) => String::new(),
            };
            ctx.reporter
                .err_with_log(format!("Unable to deploy compose project {name}"), log);
            anyhow::bail!("compose up failed for project {name}");
        }
    }
}

/// Fetch and unpack the build-context tarball. The unpacked tree is only
/// rebuilt when the tarball digest moves past the recorded state.
async fn fetch_context(
    project: &ComposeProject,
    project_dir: &Path,
    ctx: &BundleContext<'_>,
) -> Result<bool> {
    let source = ctx.resolve(&project.context).await;
    let tarball = project_dir.join("_tmp").join("context.tar.gz");
    let tarball_str = tarball.to_string_lossy().into_owned();

    let downloaded = ctx
        .files
        .download_file(&ctx.reporter, "compose", &source, &tarball_str, None)
        .await?;

    let sha256 = crate::files::file_digest_hex(&tarball, qbee_shared::files::DigestAlgorithm::Sha256)
        .await?
        .context("context tarball disappeared after download")?;
    let desired = ContextState {
        source: source.clone(),
        sha256,
    };

    if !downloaded && ContextState::load(project_dir).as_ref() == Some(&desired) {
        return Ok(false);
    }

    let context_dir = project_dir.join("context");
    if context_dir.exists() {
        std::fs::remove_dir_all(&context_dir).context("failed to clear old build context")?;
    }
    std::fs::create_dir_all(&context_dir).context("failed to create build context dir")?;

    let unpack = format!(
        "tar -xzf {} -C {}",
        tarball_str,
        context_dir.to_string_lossy()
    );
    if let Err(e) = run_shell(&unpack, Some(ctx.remaining())).await {
        anyhow::bail!("failed to unpack build context: {e}");
    }

    desired.save(project_dir)?;
    Ok(true)
}

/// Tear down cached projects that are no longer configured.
async fn clean_projects(
    compose_root: &Path,
    configured: &HashSet<String>,
    ctx: &BundleContext<'_>,
    runtime: ComposeRuntime,
) {
    let entries = match std::fs::read_dir(compose_root) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if configured.contains(&name) {
            continue;
        }

        let compose_file = entry.path().join("compose.yml");
        if compose_file.exists() {
            let command = down_command(runtime, &name, &compose_file.to_string_lossy());
            if let Err(e) = run_shell(&command, Some(ctx.remaining())).await {
                ctx.reporter.err_with_log(
                    format!("Unable to tear down compose project {name}"),
                    e.output_tail().to_string(),
                );
                continue;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(entry.path()) {
            ctx.reporter
                .err(format!("Unable to remove compose project {name}: {e}"));
            continue;
        }
        ctx.reporter
            .info(format!("Removed compose project {name}"));
    }
}
