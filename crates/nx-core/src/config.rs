//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for tools, cache layout, encoder profiles, streaming and
//! playback capabilities. Every section defaults sensibly so a completely
//! empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::EncoderProfile;
use crate::Error;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default consumer buffer high-water mark: 8 MiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 8 * 1024 * 1024;

/// Default backpressure poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default limit for a single `mp4info` run, in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 120;

/// Tools that accept a path override and a timeout.
const TOOL_NAMES: &[&str] = &["ffmpeg", "mp4info", "mp4fragment"];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub cache: CacheConfig,
    pub transcode: TranscodeConfig,
    pub streaming: StreamingConfig,
    pub playback: PlaybackConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.streaming.chunk_size == 0 {
            warnings.push("streaming.chunk_size is 0; the default of 65536 will be used".into());
        }
        if self.streaming.high_water_mark < self.streaming.chunk_size {
            warnings.push(format!(
                "streaming.high_water_mark ({}) is smaller than one chunk ({})",
                self.streaming.high_water_mark, self.streaming.chunk_size
            ));
        }
        if self.streaming.poll_interval_ms == 0 {
            warnings.push("streaming.poll_interval_ms is 0; backpressure will busy-poll".into());
        }

        for (tool, secs) in &self.tools.timeout_secs {
            if !TOOL_NAMES.contains(&tool.as_str()) {
                warnings.push(format!("tools.timeout_secs has an entry for unknown tool '{tool}'"));
            } else if *secs == 0 {
                warnings.push(format!("tools.timeout_secs.{tool} is 0; {tool} will run unlimited"));
            }
        }

        if self.cache.dir_name.is_empty() {
            warnings.push("cache.dir_name is empty; output would land next to the source".into());
        }
        if self.cache.transcoded_prefix.is_empty() {
            warnings.push(
                "cache.transcoded_prefix is empty; transcoded output would overwrite its input"
                    .into(),
            );
        }

        if !self.transcode.target_mime.contains("{codec}") {
            warnings.push(format!(
                "transcode.target_mime '{}' has no {{codec}} placeholder",
                self.transcode.target_mime
            ));
        }

        if self.playback.supported_codecs.is_empty() {
            warnings.push(
                "playback.supported_codecs is empty; every file will be fully transcoded".into(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Paths and run limits for external CLI tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub mp4info_path: Option<PathBuf>,
    pub mp4fragment_path: Option<PathBuf>,
    /// Per-tool limit in seconds for run-to-completion invocations. A tool
    /// without an entry runs until it exits. Remuxing a large file can take
    /// well over an hour, so only the prober is limited by default.
    pub timeout_secs: BTreeMap<String, u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            mp4info_path: None,
            mp4fragment_path: None,
            timeout_secs: BTreeMap::from([("mp4info".to_string(), DEFAULT_PROBE_TIMEOUT_SECS)]),
        }
    }
}

impl ToolsConfig {
    /// Run limit for `tool`, or `None` when it is unlimited.
    pub fn timeout(&self, tool: &str) -> Option<Duration> {
        self.timeout_secs
            .get(tool)
            .filter(|&&secs| secs > 0)
            .map(|&secs| Duration::from_secs(secs))
    }
}

/// Layout of the per-directory cache holding derived files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hidden subfolder created next to each source file.
    pub dir_name: String,
    /// Nested subfolder holding normalised/transcoded intermediates.
    pub intermediate_dir_name: String,
    /// Filename prefix of the transcoded intermediate.
    pub transcoded_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir_name: ".netsix".into(),
            intermediate_dir_name: "mkv".into(),
            transcoded_prefix: "t_".into(),
        }
    }
}

/// Encoder profiles used when a track must be re-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub video: EncoderProfile,
    pub audio: EncoderProfile,
    /// MIME template passed to the capability oracle; `{codec}` is replaced
    /// by the probed codec string.
    pub target_mime: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            video: EncoderProfile::default_video(),
            audio: EncoderProfile::default_audio(),
            target_mime: "video/mp4; codecs=\"{codec}\"".into(),
        }
    }
}

/// Chunked delivery and backpressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_size: usize,
    pub high_water_mark: usize,
    pub poll_interval_ms: u64,
}

impl StreamingConfig {
    /// The chunk size, falling back to the default when configured as 0.
    pub fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// The backpressure poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Codecs the playback environment decodes natively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Codec string prefixes (e.g. `avc1`, `mp4a.40`) considered playable.
    pub supported_codecs: Vec<String>,
    /// Container MIME types the environment accepts.
    pub containers: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            supported_codecs: vec![
                "avc1".into(),
                "mp4a.40".into(),
                "mp4a.69".into(),
                "mp4a.6B".into(),
            ],
            containers: vec!["video/mp4".into(), "audio/mp4".into()],
        }
    }
}

/// Pipeline routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Source extensions that are stream-copied into mp4 and probed before
    /// fragmentation.
    pub normalize_extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalize_extensions: vec!["mkv".into()],
        }
    }
}
