//! mp4info-based media probing.
//!
//! Shells out to `mp4info --format json <file>` and maps the JSON output into
//! an [`nx_core::ProbeResult`].

use std::path::{Path, PathBuf};

use nx_core::{ProbeResult, Track, TrackKind};
use serde::Deserialize;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// A prober backed by the Bento4 `mp4info` CLI.
#[derive(Debug, Clone)]
pub struct MediaProbe {
    /// Path to the mp4info binary.
    mp4info_path: PathBuf,
}

impl MediaProbe {
    /// Create a new prober using the given mp4info path.
    pub fn new(mp4info_path: PathBuf) -> Self {
        Self { mp4info_path }
    }

    /// Create a prober from the registry's `mp4info` entry.
    pub fn from_registry(tools: &ToolRegistry) -> nx_core::Result<Self> {
        Ok(Self::new(tools.require("mp4info")?.path.clone()))
    }

    /// Probe an existing container.
    ///
    /// # Errors
    ///
    /// Returns [`nx_core::Error::Probe`] if the tool cannot be run, exits
    /// non-zero, or prints output that is not the expected JSON.
    pub async fn probe(&self, path: &Path) -> nx_core::Result<ProbeResult> {
        let mut cmd = ToolCommand::new(self.mp4info_path.clone());
        cmd.args(["--format", "json"]);
        cmd.arg(path.to_string_lossy().as_ref());

        let output = cmd
            .execute()
            .await
            .map_err(|e| nx_core::Error::Probe(format!("{}: {e}", path.display())))?;

        let result = parse_mp4info_json(&output.stdout)?;
        tracing::debug!(
            "Probed {}: {} track(s), {} ms",
            path.display(),
            result.tracks.len(),
            result.duration_ms
        );
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Mp4InfoOutput {
    movie: Mp4InfoMovie,
    #[serde(default)]
    tracks: Vec<Mp4InfoTrack>,
}

#[derive(Debug, Deserialize)]
struct Mp4InfoMovie {
    duration_ms: Option<f64>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Mp4InfoTrack {
    #[serde(rename = "type")]
    track_type: String,
    #[serde(default)]
    sample_descriptions: Vec<Mp4InfoSampleDescription>,
}

#[derive(Debug, Deserialize)]
struct Mp4InfoSampleDescription {
    codecs_string: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse mp4info's JSON document.
///
/// The movie duration is read from `movie.duration_ms` when present and
/// otherwise from `movie.duration`, which is taken to be in milliseconds.
pub fn parse_mp4info_json(json: &str) -> nx_core::Result<ProbeResult> {
    let info: Mp4InfoOutput = serde_json::from_str(json)
        .map_err(|e| nx_core::Error::Probe(format!("mp4info JSON parse error: {e}")))?;

    let duration = info
        .movie
        .duration_ms
        .or(info.movie.duration)
        .unwrap_or(0.0);
    if !duration.is_finite() || duration < 0.0 {
        return Err(nx_core::Error::Probe(format!("invalid movie duration: {duration}")));
    }

    let tracks = info
        .tracks
        .into_iter()
        .map(|t| Track {
            kind: TrackKind::from_probe(&t.track_type),
            codec: t
                .sample_descriptions
                .into_iter()
                .next()
                .and_then(|d| d.codecs_string)
                .unwrap_or_default(),
        })
        .collect();

    Ok(ProbeResult {
        tracks,
        duration_ms: duration.round() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "file": {"major_brand": "isom", "minor_version": 512, "fast_start": true},
        "movie": {"duration_ms": 600000, "duration": 600000, "time_scale": 1000, "fragments": false},
        "tracks": [
            {
                "flags": 3, "id": 1, "type": "Video",
                "sample_descriptions": [{"coding": "avc1", "codecs_string": "avc1.640028"}]
            },
            {
                "flags": 3, "id": 2, "type": "Audio",
                "sample_descriptions": [{"coding": "mp4a", "codecs_string": "mp4a.40.2"}]
            },
            {"flags": 3, "id": 3, "type": "Text", "sample_descriptions": []}
        ]
    }"#;

    #[test]
    fn parses_tracks_and_duration() {
        let result = parse_mp4info_json(SAMPLE).unwrap();
        assert_eq!(result.duration_ms, 600_000);
        assert_eq!(result.tracks.len(), 3);
        assert_eq!(result.tracks[0].kind, TrackKind::Video);
        assert_eq!(result.tracks[0].codec, "avc1.640028");
        assert_eq!(result.tracks[1].kind, TrackKind::Audio);
        assert_eq!(result.tracks[1].codec, "mp4a.40.2");
        assert_eq!(result.tracks[2].kind, TrackKind::Other);
        assert_eq!(result.tracks[2].codec, "");
    }

    #[test]
    fn falls_back_to_plain_duration() {
        let json = r#"{"movie": {"duration": 1234.6}, "tracks": []}"#;
        let result = parse_mp4info_json(json).unwrap();
        assert_eq!(result.duration_ms, 1235);
        assert!(result.tracks.is_empty());
    }

    #[test]
    fn rejects_missing_movie() {
        let err = parse_mp4info_json(r#"{"tracks": []}"#).unwrap_err();
        assert!(matches!(err, nx_core::Error::Probe(_)));
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_mp4info_json("ERROR: cannot open input file").unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn rejects_negative_duration() {
        let err = parse_mp4info_json(r#"{"movie": {"duration": -5}}"#).unwrap_err();
        assert!(matches!(err, nx_core::Error::Probe(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_probe_error() {
        let probe = MediaProbe::new(PathBuf::from("nonexistent_mp4info_xyz"));
        let err = probe.probe(Path::new("/tmp/none.mp4")).await.unwrap_err();
        assert!(matches!(err, nx_core::Error::Probe(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_probe_error() {
        // `false` ignores its arguments and exits 1.
        let probe = MediaProbe::new(PathBuf::from("false"));
        let err = probe.probe(Path::new("/tmp/none.mp4")).await.unwrap_err();
        assert!(matches!(err, nx_core::Error::Probe(_)));
    }
}
