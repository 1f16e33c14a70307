//! Supervised ffmpeg encode with progress reporting and cancellation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nx_core::{JobId, TranscodePlan};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{ToolCommand, ToolProcess};
use crate::progress::ProgressTracker;
use crate::tools::ToolRegistry;

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// A running encode.
///
/// The encoder runs out of band; [`TranscodeJob::wait`] resolves with the
/// output path on success. Dropping the job without waiting cancels it.
pub struct TranscodeJob {
    id: JobId,
    output: PathBuf,
    progress: Arc<AtomicU8>,
    cancel: CancellationToken,
    task: Option<JoinHandle<nx_core::Result<PathBuf>>>,
}

impl TranscodeJob {
    /// Spawn `ffmpeg -i <source> <plan args> <output>` and start supervising
    /// it. Must be called from within a tokio runtime.
    ///
    /// `duration_ms` is the source duration used to turn the encoder's
    /// `time=` position into a percentage. `on_progress` is called from the
    /// supervisor task with each new, strictly increasing percentage, ending
    /// with 100 on success.
    pub fn start(
        tools: &ToolRegistry,
        source: &Path,
        output: &Path,
        plan: &TranscodePlan,
        duration_ms: u64,
        on_progress: impl Fn(u8) + Send + Sync + 'static,
    ) -> nx_core::Result<Self> {
        let ffmpeg = tools
            .require("ffmpeg")
            .map_err(|e| nx_core::Error::transcode("transcode", e.to_string()))?;

        let id = JobId::new();
        tracing::info!(
            "Transcode job {id:#}: {:?} -> {:?} ({plan}, duration={duration_ms}ms)",
            source,
            output,
        );

        let mut cmd = ToolCommand::for_tool(ffmpeg);
        cmd.args(["-y", "-nostdin", "-i"]);
        cmd.arg(source.to_string_lossy().as_ref());
        cmd.args(plan.ffmpeg_args());
        cmd.arg(output.to_string_lossy().as_ref());

        let process = cmd
            .spawn()
            .map_err(|e| nx_core::Error::transcode("transcode", e.to_string()))?;

        let progress = Arc::new(AtomicU8::new(0));
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            id,
            output: output.to_path_buf(),
            tracker: ProgressTracker::new(duration_ms),
            progress: progress.clone(),
            on_progress: Box::new(on_progress),
            tail: Vec::new(),
        };
        let task = tokio::spawn(supervisor.run(process, cancel.clone()));

        Ok(Self {
            id,
            output: output.to_path_buf(),
            progress,
            cancel,
            task: Some(task),
        })
    }

    /// Identifier of this job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Path the encoder writes to.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Latest progress percentage.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    /// A token that cancels this job when triggered. Lets a caller cancel
    /// while [`TranscodeJob::wait`] owns the job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. The encoder is killed and its partial output
    /// removed; [`TranscodeJob::wait`] then returns [`nx_core::Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the encode to finish.
    ///
    /// # Errors
    ///
    /// - [`nx_core::Error::Cancelled`] if the job was cancelled.
    /// - [`nx_core::Error::Transcode`] if the encoder exited with a failure
    ///   status.
    pub async fn wait(mut self) -> nx_core::Result<PathBuf> {
        let Some(task) = self.task.as_mut() else {
            return Err(nx_core::Error::Internal("transcode job already awaited".into()));
        };
        let joined = task.await;
        // Only a completed supervisor disarms the cancel-on-drop.
        self.task = None;
        joined.map_err(|e| nx_core::Error::Internal(format!("transcode supervisor panicked: {e}")))?
    }
}

impl Drop for TranscodeJob {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for TranscodeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeJob")
            .field("id", &self.id)
            .field("output", &self.output)
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

struct Supervisor {
    id: JobId,
    output: PathBuf,
    tracker: ProgressTracker,
    progress: Arc<AtomicU8>,
    on_progress: Box<dyn Fn(u8) + Send + Sync>,
    tail: Vec<String>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut process: ToolProcess,
        cancel: CancellationToken,
    ) -> nx_core::Result<PathBuf> {
        let stderr = process.take_stderr();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            status = self.drive(&mut process, stderr) => Some(status),
        };

        let status = match outcome {
            None => {
                tracing::info!("Transcode job {} cancelled", self.id);
                if let Err(e) = process.kill().await {
                    tracing::warn!("Transcode job {}: {e}", self.id);
                }
                self.remove_output().await;
                return Err(nx_core::Error::Cancelled);
            }
            Some(status) => status,
        };

        match status {
            Ok(status) if status.success() => {
                if let Some(pct) = self.tracker.finish() {
                    self.report(pct);
                }
                tracing::info!("Transcode job {} finished", self.id);
                Ok(self.output.clone())
            }
            Ok(status) => {
                self.remove_output().await;
                Err(nx_core::Error::transcode(
                    "transcode",
                    format!("ffmpeg exited with status {status}: {}", self.tail.join(" | ")),
                ))
            }
            Err(e) => {
                let _ = process.kill().await;
                self.remove_output().await;
                Err(nx_core::Error::transcode("transcode", e.to_string()))
            }
        }
    }

    /// Read stderr to the end while waiting for the process to exit.
    async fn drive(
        &mut self,
        process: &mut ToolProcess,
        stderr: Option<ChildStderr>,
    ) -> nx_core::Result<std::process::ExitStatus> {
        let (_, status) = tokio::join!(self.read_diagnostics(stderr), process.wait());
        status
    }

    async fn read_diagnostics(&mut self, stderr: Option<ChildStderr>) {
        let Some(stderr) = stderr else {
            return;
        };

        // ffmpeg terminates its stats line with `\r`, everything else with `\n`.
        let mut segments = BufReader::new(stderr).split(b'\r');
        loop {
            match segments.next_segment().await {
                Ok(Some(segment)) => {
                    let text = String::from_utf8_lossy(&segment);
                    for line in text.split('\n') {
                        self.handle_line(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Transcode job {}: stderr read error: {e}", self.id);
                    break;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        tracing::trace!("ffmpeg: {line}");

        if let Some(pct) = self.tracker.observe(line) {
            self.report(pct);
        } else {
            if self.tail.len() == STDERR_TAIL_LINES {
                self.tail.remove(0);
            }
            self.tail.push(line.to_string());
        }
    }

    fn report(&self, pct: u8) {
        self.progress.store(pct, Ordering::Release);
        (self.on_progress)(pct);
    }

    async fn remove_output(&self) {
        match tokio::fs::remove_file(&self.output).await {
            Ok(()) => tracing::debug!("Removed partial {}", self.output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {e}", self.output.display()),
        }
    }
}
