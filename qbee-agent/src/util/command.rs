use anyhow::{Context, Result, anyhow};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Keep the last 4 KiB of combined output for reports.
pub const OUTPUT_TAIL_BYTES: usize = 4 * 1024;

/// Grace period between SIGINT and SIGKILL when a deadline fires.
const KILL_GRACE: Duration = Duration::from_secs(5);

pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return fs::metadata(name).is_ok();
    }

    if let Ok(path) = env::var("PATH") {
        for dir in path.split(':') {
            let mut p = PathBuf::from(dir);
            p.push(name);
            if fs::metadata(&p).is_ok() {
                return true;
            }
        }
    }
    false
}

/// First POSIX shell found on the device. PowerShell on Windows.
pub fn find_shell() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        for name in ["bash", "zsh", "sh"] {
            for dir in ["/bin", "/usr/bin", "/usr/local/bin"] {
                let p = Path::new(dir).join(name);
                if p.exists() {
                    return Some(p);
                }
            }
        }
        None
    }
    #[cfg(windows)]
    {
        Some(PathBuf::from("powershell.exe"))
    }
}

fn shell_root() -> &'static Path {
    #[cfg(unix)]
    {
        Path::new("/")
    }
    #[cfg(windows)]
    {
        Path::new("C:\\")
    }
}

#[derive(Debug)]
pub struct CommandFailure {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_tail: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "command timed out")?;
        } else {
            let code = self
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".into());
            write!(f, "command failed (exit={code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

#[derive(Debug)]
pub enum CommandError {
    Failed(CommandFailure),
    Other(anyhow::Error),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Failed(e) => write!(f, "{e}"),
            CommandError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Failed(e) => Some(e),
            CommandError::Other(e) => Some(e.as_ref()),
        }
    }
}

impl CommandError {
    /// The bounded output tail, for Report.log.
    pub fn output_tail(&self) -> &str {
        match self {
            CommandError::Failed(e) => &e.output_tail,
            CommandError::Other(_) => "",
        }
    }
}

/// Keep only the last `limit_bytes` of whatever we read.
fn push_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit_bytes: usize) {
    if limit_bytes == 0 {
        return;
    }
    buf.extend_from_slice(chunk);
    if buf.len() > limit_bytes {
        let overflow = buf.len() - limit_bytes;
        buf.drain(0..overflow);
    }
}

async fn read_to_tail<R: AsyncRead + Unpin>(
    mut r: R,
    limit_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit_bytes.min(64 * 1024));
    let mut tmp = [0u8; 8192];

    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        push_bounded(&mut out, &tmp[..n], limit_bytes);
    }
    Ok(out)
}

/// Signal the whole process tree, SIGINT first, SIGKILL after the grace
/// period. The child was started in its own process group.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGINT);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Run a prepared command, capturing a bounded combined output tail.
/// Returns the tail on exit zero; a `CommandFailure` with the tail
/// otherwise. `deadline == None` means wait indefinitely.
pub async fn run_command(
    mut cmd: Command,
    deadline: Option<Duration>,
) -> Result<String, CommandError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .context("spawn failed")
        .map_err(CommandError::Other)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Other(anyhow!("stdout missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Other(anyhow!("stderr missing")))?;

    // Read both streams concurrently while the process runs.
    let stdout_task = tokio::spawn(async move { read_to_tail(stdout, OUTPUT_TAIL_BYTES).await });
    let stderr_task = tokio::spawn(async move { read_to_tail(stderr, OUTPUT_TAIL_BYTES).await });

    let mut timed_out = false;
    let status = if let Some(limit) = deadline {
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(res) => Some(res.context("wait failed").map_err(CommandError::Other)?),
            Err(_) => {
                timed_out = true;
                kill_process_group(&mut child).await;
                None
            }
        }
    } else {
        Some(
            child
                .wait()
                .await
                .context("wait failed")
                .map_err(CommandError::Other)?,
        )
    };

    let stdout_tail = stdout_task
        .await
        .context("join stdout reader")
        .map_err(CommandError::Other)?
        .unwrap_or_default();
    let stderr_tail = stderr_task
        .await
        .context("join stderr reader")
        .map_err(CommandError::Other)?
        .unwrap_or_default();

    let mut combined = Vec::new();
    push_bounded(&mut combined, &stdout_tail, OUTPUT_TAIL_BYTES);
    if !combined.is_empty() && !combined.ends_with(b"\n") && !stderr_tail.is_empty() {
        push_bounded(&mut combined, b"\n", OUTPUT_TAIL_BYTES);
    }
    push_bounded(&mut combined, &stderr_tail, OUTPUT_TAIL_BYTES);
    let output_tail = String::from_utf8_lossy(&combined).into_owned();

    match status {
        Some(status) if status.success() => Ok(output_tail),
        Some(status) => Err(CommandError::Failed(CommandFailure {
            exit_code: status.code(),
            timed_out: false,
            output_tail,
        })),
        None => Err(CommandError::Failed(CommandFailure {
            exit_code: None,
            timed_out,
            output_tail,
        })),
    }
}

/// Run a script through the device shell with `/` as the working directory.
pub async fn run_shell(script: &str, deadline: Option<Duration>) -> Result<String, CommandError> {
    let shell = find_shell()
        .ok_or_else(|| CommandError::Other(anyhow!("no shell found on this device")))?;

    let mut cmd = Command::new(shell);
    #[cfg(unix)]
    cmd.arg("-c");
    #[cfg(windows)]
    cmd.args(["-NoProfile", "-Command"]);
    cmd.arg(script);
    cmd.current_dir(shell_root());

    run_command(cmd, deadline).await
}

/// Run an argv-style command (no shell involved).
pub async fn run_argv<S: AsRef<str>>(
    argv: &[S],
    deadline: Option<Duration>,
) -> Result<String, CommandError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CommandError::Other(anyhow!("empty argv")))?;

    let mut cmd = Command::new(program.as_ref());
    for arg in args {
        cmd.arg(arg.as_ref());
    }
    run_command(cmd, deadline).await
}

/// Evaluate a pre-condition expression. An empty (or whitespace-only)
/// expression holds; otherwise the expression holds iff it exits zero.
pub async fn pre_condition_holds(pre: &str, deadline: Option<Duration>) -> Result<bool> {
    let trimmed = pre.trim();
    if trimmed.is_empty() {
        return Ok(true);
    }

    match run_shell(trimmed, deadline).await {
        Ok(_) => Ok(true),
        Err(CommandError::Failed(_)) => Ok(false),
        Err(CommandError::Other(e)) => Err(e),
    }
}
