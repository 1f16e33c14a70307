//! Playback capability queries.
//!
//! The decision engine asks a [`CapabilityOracle`] whether a
//! `container; codecs="..."` string is natively decodable.

use nx_core::config::PlaybackConfig;

/// Answers "can the playback environment decode this MIME string?".
pub trait CapabilityOracle: Send + Sync {
    /// # Errors
    ///
    /// Returns [`nx_core::Error::CapabilityQuery`] if the query itself cannot
    /// be answered. Callers treat this as fatal and do not fall back.
    fn is_supported(&self, mime: &str) -> nx_core::Result<bool>;
}

/// Query `oracle` for a single codec, substituting it into `template`
/// (`{codec}` placeholder).
pub fn supports_codec(
    oracle: &dyn CapabilityOracle,
    template: &str,
    codec: &str,
) -> nx_core::Result<bool> {
    let mime = template.replace("{codec}", codec);
    let supported = oracle.is_supported(&mime)?;
    tracing::debug!("capability {mime}: {supported}");
    Ok(supported)
}

/// Oracle answering from a fixed allowlist of codec prefixes.
#[derive(Debug, Clone)]
pub struct StaticCapabilities {
    containers: Vec<String>,
    codec_prefixes: Vec<String>,
}

impl StaticCapabilities {
    pub fn new(
        containers: impl IntoIterator<Item = impl Into<String>>,
        codec_prefixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            containers: containers
                .into_iter()
                .map(|c| c.into().to_ascii_lowercase())
                .collect(),
            codec_prefixes: codec_prefixes
                .into_iter()
                .map(|c| c.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(playback: &PlaybackConfig) -> Self {
        Self::new(&playback.containers, &playback.supported_codecs)
    }

    fn codec_allowed(&self, codec: &str) -> bool {
        let codec = codec.to_ascii_lowercase();
        self.codec_prefixes.iter().any(|prefix| {
            codec == *prefix
                || codec
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl CapabilityOracle for StaticCapabilities {
    fn is_supported(&self, mime: &str) -> nx_core::Result<bool> {
        let (container, codecs) = parse_mime(mime)?;
        if !self.containers.iter().any(|c| *c == container) {
            return Err(nx_core::Error::CapabilityQuery(format!(
                "unknown container type {container:?}"
            )));
        }
        Ok(codecs.iter().all(|codec| self.codec_allowed(codec)))
    }
}

/// Split `video/mp4; codecs="a, b"` into the lowercased container and the
/// codec list.
fn parse_mime(mime: &str) -> nx_core::Result<(String, Vec<String>)> {
    let mut parts = mime.split(';');
    let container = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    if container.is_empty() {
        return Err(nx_core::Error::CapabilityQuery(format!("malformed MIME string {mime:?}")));
    }

    let codecs_param = parts
        .map(str::trim)
        .find_map(|p| {
            let (key, value) = p.split_once('=')?;
            key.trim().eq_ignore_ascii_case("codecs").then_some(value)
        })
        .ok_or_else(|| {
            nx_core::Error::CapabilityQuery(format!("no codecs parameter in {mime:?}"))
        })?;

    let codecs: Vec<String> = codecs_param
        .trim()
        .trim_matches('"')
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if codecs.is_empty() {
        return Err(nx_core::Error::CapabilityQuery(format!("empty codecs parameter in {mime:?}")));
    }

    Ok((container, codecs))
}
