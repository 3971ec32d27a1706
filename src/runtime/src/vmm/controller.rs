//! CliController - Drives a backend's command-line tool.
//!
//! Each backend talks to its control plane through the vendor CLI
//! (`aws`, `gcloud`, `VBoxManage`). The controller spawns one subprocess per
//! call, waits for it, and hands back stdout.

use std::fmt;
use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::process::Command;

/// Failure of a single CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    /// Rendered command line, for diagnostics
    pub command: String,
    /// stderr of the failed process, or the spawn/parse error
    pub message: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed: {}", self.command, self.message)
    }
}

/// Controller for one vendor CLI binary.
#[derive(Debug, Clone)]
pub struct CliController {
    program: String,
}

impl CliController {
    /// Create a controller for `program` (looked up in PATH).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run the tool and return its stdout.
    ///
    /// No timeout is applied; the call lasts as long as the tool does.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String, CommandFailure> {
        let rendered = self.render(args);
        tracing::debug!(command = %rendered, "Running backend command");

        let output = Command::new(&self.program)
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CommandFailure {
                command: rendered.clone(),
                message: format!("failed to spawn {}: {}", self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            tracing::debug!(command = %rendered, error = %message, "Backend command failed");
            return Err(CommandFailure {
                command: rendered,
                message,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run the tool and deserialize its stdout as JSON.
    pub async fn run_json<T: DeserializeOwned, S: AsRef<str>>(
        &self,
        args: &[S],
    ) -> Result<T, CommandFailure> {
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout).map_err(|e| CommandFailure {
            command: self.render(args),
            message: format!("unparseable output: {}", e),
        })
    }

    fn render<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut rendered = self.program.clone();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(arg.as_ref());
        }
        rendered
    }
}
