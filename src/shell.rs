//! Host command execution.
//!
//! Commands are fixed command lines bound in the command table; nothing from
//! chat input ever reaches the shell.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs a command line and returns whatever it printed to stdout.
/// Failures yield empty or partial output instead of an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Shell: Send + Sync {
    async fn run(&self, cmdline: &str) -> String;
}

/// Runs command lines through `sh -c`
pub struct SystemShell {
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl SystemShell {
    pub fn new(workdir: Option<PathBuf>, timeout: Duration) -> Self {
        Self { workdir, timeout }
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(30))
    }
}

#[async_trait]
impl Shell for SystemShell {
    async fn run(&self, cmdline: &str) -> String {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmdline)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    warn!(
                        command = %cmdline,
                        exit_code = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "command exited with failure"
                    );
                }
                debug!(command = %cmdline, bytes = output.stdout.len(), "command finished");
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(Err(e)) => {
                warn!(command = %cmdline, error = %e, "failed to execute command");
                String::new()
            }
            Err(_) => {
                warn!(command = %cmdline, timeout_secs = self.timeout.as_secs(), "command timed out");
                String::new()
            }
        }
    }
}
