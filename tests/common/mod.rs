//! Shared harness for integration tests.
//!
//! Stands in shell scripts for ffmpeg, mp4info and mp4fragment so the
//! pipeline can run end to end without the real tools installed.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nx_av::ToolRegistry;
use nx_core::config::Config;
use nx_core::events::{Event, EventPayload};
use nx_pipeline::{Orchestrator, StaticCapabilities};
use tokio::sync::broadcast;

/// Encoder stats line placing the encode at 5 of 10 minutes.
pub const HALFWAY_STATS: &str =
    "frame=  100 fps=25 q=28.0 size=    1024kB time=00:05:00.00 bitrate=2000kbits/s speed=1x";

/// Transcode that reports 50% and finishes immediately. The output is tagged
/// so the fake mp4info reports H.264 for it.
pub fn fast_transcode() -> String {
    format!(
        "printf '{HALFWAY_STATS}\\r' >&2\n{{ printf TRANSCODED; cat \"$in\"; }} > \"$last\"\n"
    )
}

/// Transcode that writes partial output and then dies.
pub fn failing_transcode() -> String {
    format!(
        "printf '{HALFWAY_STATS}\\r' >&2\nprintf partial > \"$last\"\necho 'Unknown encoder libx264' >&2\nexit 1\n"
    )
}

/// mp4fragment that copies its input.
pub fn copying_fragment() -> String {
    "cp \"$1\" \"$2\"\n".to_string()
}

/// mp4fragment that leaves a truncated destination behind and fails.
pub fn failing_fragment() -> String {
    "printf truncated > \"$2\"\necho 'ERROR: no moov box' >&2\nexit 2\n".to_string()
}

/// Transcode that writes partial output and then hangs until killed.
pub fn hanging_transcode() -> String {
    format!("printf '{HALFWAY_STATS}\\r' >&2\nprintf partial > \"$last\"\nexec sleep 30\n")
}

/// Write an executable `#!/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fake tool set living in `bin_dir`.
///
/// - `ffmpeg` stream-copies when called with `-sn` (normalisation) and runs
///   `transcode_body` otherwise, with `$in` and `$last` set to the input and
///   output paths. Every invocation is appended to `ffmpeg.log`.
/// - `mp4info` reports a 10 minute file with HEVC video and AAC audio, or
///   H.264 video once the file carries the transcode tag.
/// - `mp4fragment` counts its invocations in `mp4fragment.count` and then
///   runs `fragment_body` (a plain copy for [`FakeTools::install`]).
pub struct FakeTools {
    pub registry: ToolRegistry,
    pub ffmpeg_log: PathBuf,
    pub fragment_count: PathBuf,
}

impl FakeTools {
    pub fn install(bin_dir: &Path, transcode_body: &str) -> Self {
        Self::install_with(bin_dir, transcode_body, &copying_fragment())
    }

    pub fn install_with(bin_dir: &Path, transcode_body: &str, fragment_body: &str) -> Self {
        let ffmpeg_log = bin_dir.join("ffmpeg.log");
        let fragment_count = bin_dir.join("mp4fragment.count");

        let ffmpeg = write_script(
            bin_dir,
            "ffmpeg",
            &format!(
                r#"echo "$@" >> '{log}'
for last; do :; done
in=""
prev=""
for a; do
    if [ "$prev" = "-i" ]; then in="$a"; fi
    prev="$a"
done
case " $* " in
    *" -sn "*) cp "$in" "$last"; exit 0 ;;
esac
{body}"#,
                log = ffmpeg_log.display(),
                body = transcode_body,
            ),
        );

        let mp4info = write_script(
            bin_dir,
            "mp4info",
            r#"for last; do :; done
if grep -q TRANSCODED "$last"; then video=avc1.640028; else video=hev1.1.6.L93.B0; fi
cat <<JSON
{"movie": {"duration_ms": 600000},
 "tracks": [
  {"type": "Video", "sample_descriptions": [{"codecs_string": "$video"}]},
  {"type": "Audio", "sample_descriptions": [{"codecs_string": "mp4a.40.2"}]}
 ]}
JSON
"#,
        );

        let mp4fragment = write_script(
            bin_dir,
            "mp4fragment",
            &format!(
                "echo run >> '{count}'\n{fragment_body}",
                count = fragment_count.display()
            ),
        );

        Self {
            registry: ToolRegistry::default()
                .with_tool("ffmpeg", ffmpeg)
                .with_tool("mp4info", mp4info)
                .with_tool("mp4fragment", mp4fragment),
            ffmpeg_log,
            fragment_count,
        }
    }

    pub fn fragment_runs(&self) -> usize {
        std::fs::read_to_string(&self.fragment_count)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn ffmpeg_calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.ffmpeg_log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Config with a fast backpressure poll for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.streaming.poll_interval_ms = 10;
    config
}

pub fn orchestrator(tools: ToolRegistry) -> Orchestrator {
    let config = test_config();
    let oracle = Arc::new(StaticCapabilities::from_config(&config.playback));
    Orchestrator::new(config, tools, oracle)
}

/// Deterministic source bytes.
pub fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Collect event payloads until `stop` matches one (inclusive).
pub async fn collect_until(
    rx: &mut broadcast::Receiver<Event>,
    stop: impl Fn(&EventPayload) -> bool,
) -> Vec<EventPayload> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for pipeline event")
            .expect("event bus closed");
        let done = stop(&event.payload);
        seen.push(event.payload);
        if done {
            return seen;
        }
    }
}

/// Drain whatever is already queued on the receiver.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<EventPayload> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.payload);
    }
    seen
}

pub fn is_terminal(payload: &EventPayload) -> bool {
    matches!(
        payload,
        EventPayload::FileReady { .. } | EventPayload::Failed { .. } | EventPayload::Cancelled
    )
}
