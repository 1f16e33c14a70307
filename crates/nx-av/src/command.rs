//! Builder for executing external tool commands.
//!
//! [`ToolCommand::execute`] runs a tool to completion, optionally bounded by
//! a timeout, and captures its output. [`ToolCommand::spawn`] starts it in the background
//! and hands back a [`ToolProcess`] whose stderr can be streamed and which can
//! be killed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, Command};

use crate::tools::ToolConfig;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use nx_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> nx_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("mp4info"))
///     .arg("--format").arg("json")
///     .arg("/path/to/video.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ToolCommand {
    /// Create a new command for the given program path, with no time limit.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Create a command for a registered tool, inheriting its timeout.
    pub fn for_tool(tool: &ToolConfig) -> Self {
        let mut cmd = Self::new(tool.path.clone());
        cmd.timeout = tool.timeout;
        cmd
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = Some(d);
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - Returns [`nx_core::Error::Tool`] if a timeout is set and the process
    ///   outlives it (message includes the duration). The child is killed.
    /// - Returns [`nx_core::Error::Tool`] if the process exits with a non-zero
    ///   status (message includes stderr).
    /// - Returns [`nx_core::Error::Tool`] if spawning the process fails.
    pub async fn execute(&self) -> nx_core::Result<ToolOutput> {
        let program_name = self.program_name();

        tracing::debug!("exec {} {}", program_name, self.args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| nx_core::Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        // Dropping the future on expiry kills the child.
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output()).await,
            None => Ok(child.wait_with_output().await),
        };

        match result {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(nx_core::Error::tool(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            tool_output.stderr.trim()
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(nx_core::Error::tool(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            Err(_elapsed) => Err(nx_core::Error::tool(
                program_name,
                format!("timed out after {:?}", self.timeout.unwrap_or_default()),
            )),
        }
    }

    /// Start the command without waiting for it.
    ///
    /// Stdout is discarded and stderr is piped for the caller to read. The
    /// timeout does not apply; the caller owns the lifecycle and the child is
    /// killed if the [`ToolProcess`] is dropped.
    pub fn spawn(&self) -> nx_core::Result<ToolProcess> {
        let program_name = self.program_name();

        tracing::debug!("spawn {} {}", program_name, self.args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| nx_core::Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        Ok(ToolProcess {
            name: program_name,
            child,
        })
    }
}

/// A running external tool.
#[derive(Debug)]
pub struct ToolProcess {
    name: String,
    child: Child,
}

impl ToolProcess {
    /// Name of the executable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the piped stderr stream. Returns `None` on the second call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> nx_core::Result<ExitStatus> {
        self.child.wait().await.map_err(|e| {
            nx_core::Error::tool(&self.name, format!("I/O error waiting for process: {e}"))
        })
    }

    /// Kill the process and wait for it to be reaped. Killing a process that
    /// already exited is not an error.
    pub async fn kill(&mut self) -> nx_core::Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(nx_core::Error::tool(&self.name, format!("failed to kill: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        // `echo` should be universally available.
        let output = ToolCommand::new(PathBuf::from("echo"))
            .arg("hello")
            .execute()
            .await;

        match output {
            Ok(out) => {
                assert!(out.status.success());
                assert!(out.stdout.trim().contains("hello"));
            }
            Err(_) => {
                // On some minimal environments echo may not exist; skip.
            }
        }
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_reports_failure_with_stderr() {
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo broken input >&2; exit 3"])
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("broken input"), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_fires() {
        // `sleep 10` should be killed well before 10 seconds.
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out"), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unlimited_command_outlives_short_runs() {
        let registry = crate::tools::ToolRegistry::default().with_tool("mp4fragment", "sh");
        let tool = registry.require("mp4fragment").unwrap();
        assert!(tool.timeout.is_none());

        let output = ToolCommand::for_tool(tool)
            .args(["-c", "sleep 0.3; echo finished"])
            .execute()
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "finished");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_stderr() {
        use tokio::io::AsyncReadExt;

        let mut process = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo progress >&2"])
            .spawn()
            .unwrap();
        let mut stderr = process.take_stderr().unwrap();
        assert!(process.take_stderr().is_none());

        let mut text = String::new();
        stderr.read_to_string(&mut text).await.unwrap();
        assert_eq!(text.trim(), "progress");
        assert!(process.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_running_process() {
        let mut process = ToolCommand::new(PathBuf::from("sleep"))
            .arg("30")
            .spawn()
            .unwrap();
        assert_eq!(process.name(), "sleep");
        process.kill().await.unwrap();
        let status = process.wait().await.unwrap();
        assert!(!status.success());
        // A second kill after exit is fine.
        process.kill().await.unwrap();
    }
}
