//! Container normalisation: stream-copy a foreign container into mp4.

use std::path::Path;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Copy the video and audio streams of `source` into an mp4 at `output`,
/// dropping subtitles. No stream is re-encoded.
///
/// # Errors
///
/// Returns [`nx_core::Error::Transcode`] with stage `normalization` if ffmpeg
/// is missing or fails; a partially written `output` is removed.
pub async fn normalize_container(
    tools: &ToolRegistry,
    source: &Path,
    output: &Path,
) -> nx_core::Result<()> {
    let ffmpeg = tools
        .require("ffmpeg")
        .map_err(|e| nx_core::Error::transcode("normalization", e.to_string()))?;

    tracing::info!("normalize {:?} -> {:?}", source, output);

    let mut cmd = ToolCommand::for_tool(ffmpeg);
    cmd.args(["-y", "-nostdin", "-i"]);
    cmd.arg(source.to_string_lossy().as_ref());
    cmd.args(["-sn", "-c:v", "copy", "-c:a", "copy"]);
    cmd.arg(output.to_string_lossy().as_ref());

    if let Err(e) = cmd.execute().await {
        if let Err(rm) = tokio::fs::remove_file(output).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {rm}", output.display());
            }
        }
        return Err(nx_core::Error::transcode("normalization", e.to_string()));
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::write_script;

    #[tokio::test]
    async fn passes_stream_copy_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let tool = write_script(
            dir.path(),
            "ffmpeg",
            &format!(
                "echo \"$@\" > '{}'\nfor last; do :; done\nprintf mp4 > \"$last\"\n",
                args_file.display()
            ),
        );
        let tools = ToolRegistry::default().with_tool("ffmpeg", tool);
        let source = dir.path().join("movie.mkv");
        let output = dir.path().join("movie.mp4");

        normalize_container(&tools, &source, &output).await.unwrap();

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "-y -nostdin -i {} -sn -c:v copy -c:a copy {}",
                source.display(),
                output.display()
            )
        );
        assert_eq!(std::fs::read(&output).unwrap(), b"mp4");
    }

    #[tokio::test]
    async fn failure_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_script(
            dir.path(),
            "ffmpeg",
            "for last; do :; done\nprintf half > \"$last\"\nexit 1\n",
        );
        let tools = ToolRegistry::default().with_tool("ffmpeg", tool);
        let output = dir.path().join("movie.mp4");

        let err = normalize_container(&tools, &dir.path().join("movie.mkv"), &output)
            .await
            .unwrap_err();
        assert!(matches!(err, nx_core::Error::Transcode { ref stage, .. } if stage == "normalization"));
        assert!(!output.exists());
    }
}
