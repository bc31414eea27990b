//! Shared subprocess runner.
//!
//! Every subprocess in the system goes through [`run_command`]: stdout and
//! stderr are drained concurrently with the exit wait. Waiting before the
//! drain deadlocks once a pipe buffer fills, so no caller may spawn its own
//! ad-hoc `Command` with piped output.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{CoordError, CoordResult};

/// Decoded result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First ~400 chars of stderr, for error messages.
    pub fn stderr_excerpt(&self) -> String {
        let trimmed = self.stderr.trim();
        if trimmed.len() <= 400 {
            trimmed.to_string()
        } else {
            let mut end = 400;
            while !trimmed.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &trimmed[..end])
        }
    }
}

/// Run `program` with `args` in `cwd` and capture its output.
///
/// Stdin is null (commands never inherit the terminal), stdout/stderr are
/// piped and read to EOF concurrently with the exit wait, then decoded as
/// UTF-8 (lossy).
pub async fn run_command(
    cwd: &Path,
    program: &str,
    args: &[&str],
    env: &BTreeMap<String, String>,
) -> CoordResult<CommandOutput> {
    debug!(program, ?args, cwd = %cwd.display(), "spawning subprocess");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoordError::Provider(format!("failed to spawn {program}: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    // Drain both pipes while waiting; never wait first.
    let stdout_task = async {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    };
    let stderr_task = async {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    };

    let (out_bytes, err_bytes, status) = tokio::join!(stdout_task, stderr_task, child.wait());
    let status = status?;

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&err_bytes).into_owned(),
    })
}

/// Convenience wrapper with no extra environment.
pub async fn run(cwd: &Path, program: &str, args: &[&str]) -> CoordResult<CommandOutput> {
    run_command(cwd, program, args, &BTreeMap::new()).await
}
