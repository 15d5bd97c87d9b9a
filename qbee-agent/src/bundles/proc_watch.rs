use super::BundleContext;
use crate::util::command::{CommandError, run_shell};
use anyhow::Result;
use qbee_shared::config::{ProcWatchBundle, ProcessPolicy};
use std::collections::HashSet;

/// Names of all running processes, from /proc/<pid>/comm.
#[cfg(target_os = "linux")]
pub(crate) fn running_processes() -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            names.insert(comm.trim().to_string());
        }
    }
    Ok(names)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn running_processes() -> Result<HashSet<String>> {
    Ok(HashSet::new())
}

/// Whether the watcher's command needs to run for the observed state.
pub(crate) fn needs_action(policy: ProcessPolicy, running: bool) -> bool {
    match policy {
        ProcessPolicy::Present => !running,
        ProcessPolicy::Absent => running,
    }
}

pub(crate) async fn execute(bundle: &ProcWatchBundle, ctx: &BundleContext<'_>) -> Result<()> {
    let running = running_processes()?;

    for watcher in &bundle.processes {
        let name = ctx.resolve(&watcher.name).await;
        if name.is_empty() || !needs_action(watcher.policy, running.contains(&name)) {
            continue;
        }

        let command = ctx.resolve(&watcher.command).await;
        let (verb, done) = match watcher.policy {
            ProcessPolicy::Present => ("start", "started"),
            ProcessPolicy::Absent => ("stop", "stopped"),
        };

        match run_shell(&command, Some(ctx.remaining())).await {
            Ok(_) => ctx
                .reporter
                .info(format!("Successfully {done} process {name}")),
            Err(e) => {
                let log = match &e {
                    CommandError::Failed(f) => f.output_tail.clone(),
                    CommandError::Other(_) => String::new(),
                };
                ctx.reporter
                    .err_with_log(format!("Unable to {verb} process {name}"), log);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_action_matrix() {
        assert!(needs_action(ProcessPolicy::Present, false));
        assert!(!needs_action(ProcessPolicy::Present, true));
        assert!(needs_action(ProcessPolicy::Absent, true));
        assert!(!needs_action(ProcessPolicy::Absent, false));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_running_processes_sees_this_test() {
        let names = running_processes().unwrap();
        assert!(!names.is_empty());
    }
}
