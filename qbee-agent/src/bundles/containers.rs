use super::BundleContext;
use crate::util::command::{CommandError, run_argv, run_shell};
use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use qbee_shared::config::{Container, ContainersBundle, RegistryAuth};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Label carrying the configured container name; identifies containers
/// owned by this bundle.
const ID_LABEL: &str = "qbee-docker-id";
/// Label carrying the digest of the arguments the container was started
/// with; a mismatch means the configuration changed underneath it.
const ARGS_LABEL: &str = "qbee-docker-args-sha";

const DEFAULT_DOCKER_REGISTRY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn cli(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    pub fn cache_subdir(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker_containers",
            ContainerRuntime::Podman => "podman_containers",
        }
    }

    fn auth_file(self) -> Option<PathBuf> {
        match self {
            ContainerRuntime::Docker => {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker/config.json"))
            }
            ContainerRuntime::Podman => std::env::var_os("XDG_RUNTIME_DIR")
                .map(|dir| PathBuf::from(dir).join("containers/auth.json")),
        }
    }
}

/// State of the bundle-owned container as observed via `container ls`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObservedContainer {
    pub running: bool,
    pub args_sha: Option<String>,
}

/// Parse `--format {{.State}}\t{{.Labels}}` output.
pub(crate) fn parse_ls_output(output: &str) -> Option<ObservedContainer> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let (state, labels) = line.split_once('\t').unwrap_or((line, ""));

    let args_sha = labels.split(',').find_map(|label| {
        let (key, value) = label.trim().split_once('=')?;
        (key == ARGS_LABEL).then(|| value.to_string())
    });

    Some(ObservedContainer {
        running: state.trim() == "running",
        args_sha,
    })
}

/// The run arguments a container is (re)created with, minus the args-sha
/// label itself.
pub(crate) fn run_args(name: &str, image: &str, args: &str, env_file: Option<&str>) -> String {
    let mut out = format!("--name {name} --label {ID_LABEL}={name}");
    if let Some(env_file) = env_file {
        out.push_str(&format!(" --env-file {env_file}"));
    }
    if !args.trim().is_empty() {
        out.push(' ');
        out.push_str(args.trim());
    }
    out.push(' ');
    out.push_str(image);
    out
}

/// Digest over the canonicalised run arguments.
pub(crate) fn args_sha(run_args: &str) -> String {
    hex::encode(Sha256::digest(run_args.as_bytes()))
}

pub(crate) fn run_command_line(runtime: ContainerRuntime, run_args: &str, sha: &str) -> String {
    format!(
        "{} run -d --label {ARGS_LABEL}={sha} {run_args}",
        runtime.cli()
    )
}

fn registry_auth_b64(username: &str, password: &str) -> String {
    BASE64.encode(format!("{username}:{password}"))
}

/// Whether the runtime's cached credential file already carries this exact
/// credential for the registry.
pub(crate) fn is_logged_in(auth_json: &str, server: &str, expected_b64: &str) -> bool {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(auth_json) else {
        return false;
    };
    parsed
        .get("auths")
        .and_then(|auths| auths.get(server))
        .and_then(|entry| entry.get("auth"))
        .and_then(|auth| auth.as_str())
        .is_some_and(|auth| auth == expected_b64)
}

async fn authenticate(
    bundle_auth: &RegistryAuth,
    runtime: ContainerRuntime,
    ctx: &BundleContext<'_>,
) {
    let username = ctx.resolve(&bundle_auth.username).await;
    let password = ctx.resolve(&bundle_auth.password).await;
    let server = ctx.resolve(&bundle_auth.server).await;

    let auth_key = if server.is_empty() {
        DEFAULT_DOCKER_REGISTRY.to_string()
    } else {
        server.clone()
    };
    let expected = registry_auth_b64(&username, &password);

    if let Some(auth_file) = runtime.auth_file() {
        if let Ok(content) = std::fs::read_to_string(&auth_file) {
            if is_logged_in(&content, &auth_key, &expected) {
                return;
            }
        }
    }

    let mut argv = vec![
        runtime.cli().to_string(),
        "login".to_string(),
        "-u".to_string(),
        username,
        "-p".to_string(),
        password,
    ];
    if !server.is_empty() {
        argv.push(server.clone());
    }

    match run_argv(&argv, Some(ctx.remaining())).await {
        Ok(_) => ctx.reporter.info(format!(
            "Successfully authenticated with registry {}",
            if server.is_empty() { &auth_key } else { &server }
        )),
        Err(e) => ctx.reporter.err_with_log(
            format!("Unable to authenticate with registry {auth_key}"),
            e.output_tail().to_string(),
        ),
    }
}

pub(crate) async fn execute(
    bundle: &ContainersBundle,
    ctx: &BundleContext<'_>,
    runtime: ContainerRuntime,
) -> Result<()> {
    for auth in &bundle.registry_auths {
        authenticate(auth, runtime, ctx).await;
    }

    for container in &bundle.containers {
        let name = ctx.resolve(&container.name).await;
        if name.is_empty() {
            continue;
        }
        let image = ctx.resolve(&container.image).await;
        let args = ctx.resolve(&container.args).await;

        // Environment file is cached under a digest of the container name.
        let mut env_changed = false;
        let env_file = if container.env_file.is_empty() {
            None
        } else {
            let file_name = format!("{}.envfile", hex::encode(Sha256::digest(name.as_bytes())));
            let dst = ctx
                .files
                .cache_dir()
                .join(runtime.cache_subdir())
                .join(file_name);
            let dst_str = dst.to_string_lossy().into_owned();
            match ctx
                .files
                .download_file(&ctx.reporter, "containers", &container.env_file, &dst_str, None)
                .await
            {
                Ok(created) => {
                    env_changed = created;
                    Some(dst_str)
                }
                Err(e) => {
                    ctx.reporter.err(format!(
                        "Unable to fetch environment file for container {name}: {e:#}"
                    ));
                    continue;
                }
            }
        };

        let desired_args = run_args(&name, &image, &args, env_file.as_deref());
        let desired_sha = args_sha(&desired_args);

        let filter = format!("label={ID_LABEL}={name}");
        let observed = match run_argv(
            &[
                runtime.cli(),
                "container",
                "ls",
                "-a",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.State}}\t{{.Labels}}",
            ],
            Some(ctx.remaining()),
        )
        .await
        {
            Ok(output) => parse_ls_output(&output),
            Err(e) => {
                ctx.reporter.err_with_log(
                    format!("Unable to query container {name}"),
                    e.output_tail().to_string(),
                );
                continue;
            }
        };

        match observed {
            None => {
                start_container(ctx, runtime, &name, &desired_args, &desired_sha, "started").await;
            }
            Some(state)
                if state.running
                    && state.args_sha.as_deref() == Some(desired_sha.as_str())
                    && !env_changed => {}
            Some(_) if container.skip_restart => {}
            Some(_) => {
                // Outdated or stopped: replace it.
                let _ = run_argv(&[runtime.cli(), "kill", name.as_str()], Some(ctx.remaining()))
                    .await;
                if let Err(e) = run_argv(
                    &[runtime.cli(), "rm", "-f", name.as_str()],
                    Some(ctx.remaining()),
                )
                .await
                {
                    ctx.reporter.err_with_log(
                        format!("Unable to remove container {name}"),
                        e.output_tail().to_string(),
                    );
                    continue;
                }
                start_container(ctx, runtime, &name, &desired_args, &desired_sha, "restarted")
                    .await;
            }
        }
    }

    Ok(())
}

async fn start_container(
    ctx: &BundleContext<'_>,
    runtime: ContainerRuntime,
    name: &str,
    desired_args: &str,
    sha: &str,
    verb: &str,
) {
    let command = run_command_line(runtime, desired_args, sha);
    match run_shell(&command, Some(ctx.remaining())).await {
        Ok(_) => ctx
            .reporter
            .info(format!("Successfully {verb} container {name}")),
        Err(e) => {
            let log = match &e {
                CommandError::Failed(f) => f.output_tail.clone(),
                CommandError::Other(_) => String::new(),
            };
            ctx.reporter
                .err_with_log(format!("Unable to start container {name}"), log);
        }
    }
}
