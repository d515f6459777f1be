use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::common::error::DwOpResult;

/// Synthetic status reported when a child had to be killed on timeout.
pub const TIMEOUT_STATUS: i32 = 124;

/// Commands slower than this are logged at info level even without the
/// debug flag.
const SLOW_COMMAND: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn ok(stdout: &str) -> Self {
        CmdOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        CmdOutput {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Best human-readable message for state descriptions: stderr when
    /// present, stdout otherwise.
    pub fn message(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Run `program` with `args`, capturing stdout/stderr. The child is killed
/// once `timeout` elapses and a synthetic nonzero status is reported; a
/// nonzero exit is *not* an `Err` here, callers decide what failure means.
/// Safe to call from any number of concurrent workers.
pub async fn run_command(
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> DwOpResult<CmdOutput> {
    log::debug!(
        "Running DataWarp command `{} {}`",
        program.display(),
        args.join(" ")
    );

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command
        .spawn()
        .with_context(|| format!("Cannot start {}", program.display()))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output =
                output.with_context(|| format!("{} execution failed", program.display()))?;
            CmdOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: output.stdout.to_str_lossy().into_owned(),
                stderr: output.stderr.to_str_lossy().into_owned(),
            }
        }
        // Dropping the in-flight future kills the child (kill_on_drop).
        Err(_) => CmdOutput {
            code: TIMEOUT_STATUS,
            stdout: String::new(),
            stderr: format!(
                "killed after {}",
                humantime::format_duration(timeout)
            ),
        },
    };

    let elapsed = started.elapsed();
    if elapsed > SLOW_COMMAND {
        log::info!(
            "DataWarp command `{}` ran for {}",
            args.join(" "),
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64))
        );
    }
    log::debug!(
        "DataWarp command finished, status: {}, stdout: {}, stderr: {}",
        output.code,
        output.stdout.trim(),
        output.stderr.trim()
    );
    Ok(output)
}
