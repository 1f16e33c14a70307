//! Media-domain types: requests, cache paths, probe results, transcode plans
//! and the descriptor handed to consumers once a file is ready.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`)
//! and implement `Display` manually for consistent string representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::ids::RequestId;

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Where a media request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Playback on this machine.
    Local,
    /// A connected peer asked for the file.
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaRequest
// ---------------------------------------------------------------------------

/// A request to deliver one source file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRequest {
    pub id: RequestId,
    pub directory: PathBuf,
    pub filename: String,
    pub origin: Origin,
}

impl MediaRequest {
    /// Create a request for `directory/filename`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the filename is empty or contains a
    /// path separator.
    pub fn new(
        directory: impl Into<PathBuf>,
        filename: impl Into<String>,
        origin: Origin,
    ) -> Result<Self> {
        let filename = filename.into();
        if filename.is_empty() {
            return Err(Error::Validation("filename is empty".into()));
        }
        if filename.contains('/') || filename.contains('\\') {
            return Err(Error::Validation(format!(
                "filename must not contain a path separator: {filename}"
            )));
        }
        Ok(Self {
            id: RequestId::new(),
            directory: directory.into(),
            filename,
            origin,
        })
    }

    /// Build a request from a full path to the source file.
    pub fn from_path(path: &Path, origin: Origin) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Validation(format!("not a file path: {}", path.display())))?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::new(directory, filename, origin)
    }

    /// Full path to the source file.
    pub fn source_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    /// Lowercased source extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// Filename of the finalized container: same basename, `.mp4` extension.
    pub fn destination_filename(&self) -> String {
        let stem = Path::new(&self.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.filename.clone());
        format!("{stem}.mp4")
    }

    /// Derive all cache paths for this request.
    pub fn paths(&self, cache: &CacheConfig) -> CachePaths {
        CachePaths::derive(self, cache)
    }
}

// ---------------------------------------------------------------------------
// CachePaths
// ---------------------------------------------------------------------------

/// Deterministic file layout for one request.
///
/// ```text
/// <dir>/.netsix/<stem>.mp4          destination (finalized, fragmented)
/// <dir>/.netsix/mkv/<stem>.mp4      normalised intermediate
/// <dir>/.netsix/mkv/t_<stem>.mp4    transcoded intermediate
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub cache_dir: PathBuf,
    pub destination: PathBuf,
    pub intermediate_dir: PathBuf,
    pub normalized: PathBuf,
    pub transcoded: PathBuf,
}

impl CachePaths {
    fn derive(request: &MediaRequest, cache: &CacheConfig) -> Self {
        let dest_name = request.destination_filename();
        let cache_dir = request.directory.join(&cache.dir_name);
        let intermediate_dir = cache_dir.join(&cache.intermediate_dir_name);
        Self {
            destination: cache_dir.join(&dest_name),
            normalized: intermediate_dir.join(&dest_name),
            transcoded: intermediate_dir.join(format!("{}{dest_name}", cache.transcoded_prefix)),
            cache_dir,
            intermediate_dir,
        }
    }

    /// Remove both intermediates, ignoring files that do not exist.
    pub fn remove_intermediates(&self) {
        for path in [&self.normalized, &self.transcoded] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed intermediate {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProbeResult
// ---------------------------------------------------------------------------

/// Kind of a probed track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

impl TrackKind {
    /// Map a probe tool's track type string (case-insensitive).
    pub fn from_probe(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One track descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub kind: TrackKind,
    /// RFC 6381 codec string, e.g. `avc1.64001F` or `mp4a.40.2`.
    pub codec: String,
}

/// Track metadata of a container, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub tracks: Vec<Track>,
    pub duration_ms: u64,
}

impl ProbeResult {
    /// Codec string of the first track of the given kind.
    pub fn first_codec(&self, kind: TrackKind) -> Option<&str> {
        self.tracks
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.codec.as_str())
            .filter(|c| !c.is_empty())
    }

    /// MIME string for Media Source playback, e.g.
    /// `video/mp4; codecs="avc1.64001F, mp4a.40.2"`.
    pub fn mime_type(&self, container: &str) -> String {
        let codecs: Vec<&str> = self
            .tracks
            .iter()
            .filter(|t| t.kind != TrackKind::Other && !t.codec.is_empty())
            .map(|t| t.codec.as_str())
            .collect();
        if codecs.is_empty() {
            container.to_string()
        } else {
            format!("{container}; codecs=\"{}\"", codecs.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// TranscodePlan
// ---------------------------------------------------------------------------

/// A named encoder configuration for one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub encoder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub bitrate: String,
}

impl EncoderProfile {
    /// H.264 at a fixed 2600k bitrate with the `medium` preset.
    pub fn default_video() -> Self {
        Self {
            encoder: "libx264".into(),
            preset: Some("medium".into()),
            bitrate: "2600k".into(),
        }
    }

    /// AAC at a fixed 128k bitrate.
    pub fn default_audio() -> Self {
        Self {
            encoder: "aac".into(),
            preset: None,
            bitrate: "128k".into(),
        }
    }
}

/// What to do with one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StreamParams {
    Copy,
    Encode(EncoderProfile),
}

impl StreamParams {
    fn push_args(&self, spec: char, args: &mut Vec<String>) {
        match self {
            Self::Copy => {
                args.push(format!("-c:{spec}"));
                args.push("copy".into());
            }
            Self::Encode(profile) => {
                args.push(format!("-c:{spec}"));
                args.push(profile.encoder.clone());
                if let Some(ref preset) = profile.preset {
                    args.push("-preset".into());
                    args.push(preset.clone());
                }
                args.push(format!("-b:{spec}"));
                args.push(profile.bitrate.clone());
            }
        }
    }

    /// Whether this track is re-encoded.
    pub fn is_encode(&self) -> bool {
        matches!(self, Self::Encode(_))
    }
}

/// The action plan for a probed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "lowercase")]
pub enum TranscodePlan {
    /// Every track is natively playable; no re-encode.
    Remux,
    /// At least one track must be re-encoded.
    Transcode {
        video: StreamParams,
        audio: StreamParams,
    },
}

impl TranscodePlan {
    /// Whether the encoder has to run at all.
    pub fn needs_transcode(&self) -> bool {
        matches!(self, Self::Transcode { .. })
    }

    /// Encoder codec arguments, placed between the input and output paths.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Remux => {
                StreamParams::Copy.push_args('v', &mut args);
                StreamParams::Copy.push_args('a', &mut args);
            }
            Self::Transcode { video, audio } => {
                video.push_args('v', &mut args);
                audio.push_args('a', &mut args);
            }
        }
        args
    }
}

impl fmt::Display for TranscodePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remux => write!(f, "remux"),
            Self::Transcode { .. } => write!(f, "transcode [{}]", self.ffmpeg_args().join(" ")),
        }
    }
}

// ---------------------------------------------------------------------------
// FileDescriptor
// ---------------------------------------------------------------------------

/// Description of a finalized file, sent to the consumer before streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub request_id: RequestId,
    pub origin: Origin,
    /// Directory holding the finalized file.
    pub path: PathBuf,
    pub filename: String,
    /// Name of the file the user originally selected.
    pub source_filename: String,
    pub size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub mime_type: String,
    pub information: ProbeResult,
}

impl FileDescriptor {
    /// Full path to the finalized file.
    pub fn full_path(&self) -> PathBuf {
        self.path.join(&self.filename)
    }
}

/// Number of `chunk_size` windows needed to cover `size` bytes.
pub fn total_chunks(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// State of the active request in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Probing,
    Deciding,
    Transcoding,
    Remuxing,
    /// File finalized; waiting for the consumer to acknowledge.
    Ready,
    Streaming,
    Done,
    Aborted,
}

impl PipelineState {
    /// States in which no work is running for the request.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Idle | Self::Done | Self::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Deciding => "deciding",
            Self::Transcoding => "transcoding",
            Self::Remuxing => "remuxing",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}
