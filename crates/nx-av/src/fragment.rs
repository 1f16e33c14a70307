//! Idempotent fragmentation of an mp4 into a streaming-friendly layout.

use std::path::Path;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// What [`fragment`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The destination already existed and was reused as-is.
    Reused,
    /// mp4fragment ran and produced the destination.
    Fragmented,
}

/// Fragment `source` into `destination` with `mp4fragment`.
///
/// An existing destination is treated as valid output of an earlier run and
/// the tool is not invoked. Staleness is not checked.
///
/// # Errors
///
/// Returns [`nx_core::Error::Fragmentation`] if the tool is missing or exits
/// non-zero. Any partial destination file is removed first so a later call
/// does not mistake it for finished output.
pub async fn fragment(
    tools: &ToolRegistry,
    source: &Path,
    destination: &Path,
) -> nx_core::Result<FragmentOutcome> {
    if tokio::fs::try_exists(destination).await? {
        tracing::info!("Reusing fragmented file {}", destination.display());
        return Ok(FragmentOutcome::Reused);
    }

    let mp4fragment = tools
        .require("mp4fragment")
        .map_err(|e| nx_core::Error::Fragmentation(e.to_string()))?;

    tracing::info!("fragment {:?} -> {:?}", source, destination);

    let mut cmd = ToolCommand::for_tool(mp4fragment);
    cmd.arg(source.to_string_lossy().as_ref());
    cmd.arg(destination.to_string_lossy().as_ref());

    if let Err(e) = cmd.execute().await {
        match tokio::fs::remove_file(destination).await {
            Ok(()) => tracing::debug!("Removed partial {}", destination.display()),
            Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
            Err(rm) => tracing::warn!("Failed to remove {}: {rm}", destination.display()),
        }
        return Err(nx_core::Error::Fragmentation(e.to_string()));
    }

    Ok(FragmentOutcome::Fragmented)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::write_script;

    #[tokio::test]
    async fn second_call_reuses_destination() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        let tool = write_script(
            dir.path(),
            "mp4fragment",
            &format!("echo run >> '{}'\ncp \"$1\" \"$2\"\n", count.display()),
        );
        let tools = ToolRegistry::default().with_tool("mp4fragment", tool);

        let source = dir.path().join("in.mp4");
        let dest = dir.path().join("out.mp4");
        std::fs::write(&source, b"moov").unwrap();

        let first = fragment(&tools, &source, &dest).await.unwrap();
        let second = fragment(&tools, &source, &dest).await.unwrap();

        assert_eq!(first, FragmentOutcome::Fragmented);
        assert_eq!(second, FragmentOutcome::Reused);
        assert_eq!(std::fs::read(&dest).unwrap(), b"moov");
        let runs = std::fs::read_to_string(&count).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn existing_destination_skips_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        std::fs::write(&dest, b"old").unwrap();

        let outcome = fragment(&ToolRegistry::default(), Path::new("/nonexistent.mp4"), &dest)
            .await
            .unwrap();
        assert_eq!(outcome, FragmentOutcome::Reused);
    }

    #[tokio::test]
    async fn failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_script(
            dir.path(),
            "mp4fragment",
            "printf partial > \"$2\"\necho 'ERROR: invalid input' >&2\nexit 1\n",
        );
        let tools = ToolRegistry::default().with_tool("mp4fragment", tool);
        let dest = dir.path().join("out.mp4");

        let err = fragment(&tools, &dir.path().join("in.mp4"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, nx_core::Error::Fragmentation(_)));
        assert!(err.to_string().contains("invalid input"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn missing_tool_is_fragmentation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fragment(
            &ToolRegistry::default(),
            &dir.path().join("in.mp4"),
            &dir.path().join("out.mp4"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, nx_core::Error::Fragmentation(_)));
    }
}
