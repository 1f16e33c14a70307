//! Transcode decision: which tracks can be copied and which must be encoded.

use nx_core::config::TranscodeConfig;
use nx_core::{ProbeResult, StreamParams, TrackKind, TranscodePlan};
use serde::Serialize;

use crate::capability::{supports_codec, CapabilityOracle};

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub video_supported: bool,
    pub audio_supported: bool,
    pub plan: TranscodePlan,
}

/// Decide how to prepare a probed file for playback.
///
/// Only the first video and the first audio track are consulted. A missing
/// track (or one without a codec string) counts as unsupported, which selects
/// an encode for that stream.
///
/// | video | audio | plan |
/// |-------|-------|------|
/// | yes   | yes   | remux |
/// | yes   | no    | copy video, encode audio |
/// | no    | yes   | encode video, copy audio |
/// | no    | no    | encode both |
///
/// # Errors
///
/// Propagates [`nx_core::Error::CapabilityQuery`] from the oracle.
pub fn decide(
    probe: &ProbeResult,
    oracle: &dyn CapabilityOracle,
    profiles: &TranscodeConfig,
) -> nx_core::Result<Decision> {
    let check = |kind: TrackKind| -> nx_core::Result<bool> {
        match probe.first_codec(kind) {
            Some(codec) => supports_codec(oracle, &profiles.target_mime, codec),
            None => {
                tracing::debug!("no {kind} codec in probe result; treating as unsupported");
                Ok(false)
            }
        }
    };

    let video_supported = check(TrackKind::Video)?;
    let audio_supported = check(TrackKind::Audio)?;

    let plan = if video_supported && audio_supported {
        TranscodePlan::Remux
    } else {
        let params = |supported: bool, profile: &nx_core::EncoderProfile| {
            if supported {
                StreamParams::Copy
            } else {
                StreamParams::Encode(profile.clone())
            }
        };
        TranscodePlan::Transcode {
            video: params(video_supported, &profiles.video),
            audio: params(audio_supported, &profiles.audio),
        }
    };

    tracing::info!("decision: video_ok={video_supported} audio_ok={audio_supported} -> {plan}");

    Ok(Decision {
        video_supported,
        audio_supported,
        plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StaticCapabilities;
    use nx_core::{EncoderProfile, Track};

    fn probe(video: &str, audio: &str) -> ProbeResult {
        ProbeResult {
            tracks: vec![
                Track {
                    kind: TrackKind::Video,
                    codec: video.into(),
                },
                Track {
                    kind: TrackKind::Audio,
                    codec: audio.into(),
                },
            ],
            duration_ms: 600_000,
        }
    }

    fn oracle() -> StaticCapabilities {
        StaticCapabilities::new(["video/mp4"], ["avc1", "mp4a.40"])
    }

    fn run(video: &str, audio: &str) -> Decision {
        decide(&probe(video, audio), &oracle(), &TranscodeConfig::default()).unwrap()
    }

    #[test]
    fn both_supported_remuxes() {
        let d = run("avc1.640028", "mp4a.40.2");
        assert!(d.video_supported && d.audio_supported);
        assert_eq!(d.plan, TranscodePlan::Remux);
    }

    #[test]
    fn unsupported_audio_encodes_audio_only() {
        let d = run("avc1.640028", "ac-3");
        assert!(d.video_supported);
        assert!(!d.audio_supported);
        assert_eq!(
            d.plan,
            TranscodePlan::Transcode {
                video: StreamParams::Copy,
                audio: StreamParams::Encode(EncoderProfile::default_audio()),
            }
        );
        assert_eq!(
            d.plan.ffmpeg_args(),
            vec!["-c:v", "copy", "-c:a", "aac", "-b:a", "128k"]
        );
    }

    #[test]
    fn unsupported_video_encodes_video_only() {
        let d = run("hev1.1.6.L93.B0", "mp4a.40.2");
        assert!(!d.video_supported);
        assert!(d.audio_supported);
        assert_eq!(
            d.plan.ffmpeg_args(),
            vec!["-c:v", "libx264", "-preset", "medium", "-b:v", "2600k", "-c:a", "copy"]
        );
    }

    #[test]
    fn nothing_supported_encodes_both() {
        let d = run("vp09.00.10.08", "opus");
        assert_eq!(
            d.plan,
            TranscodePlan::Transcode {
                video: StreamParams::Encode(EncoderProfile::default_video()),
                audio: StreamParams::Encode(EncoderProfile::default_audio()),
            }
        );
    }

    #[test]
    fn missing_track_is_unsupported() {
        let audio_only = ProbeResult {
            tracks: vec![Track {
                kind: TrackKind::Audio,
                codec: "mp4a.40.2".into(),
            }],
            duration_ms: 1000,
        };
        let d = decide(&audio_only, &oracle(), &TranscodeConfig::default()).unwrap();
        assert!(!d.video_supported);
        assert!(d.audio_supported);
        assert!(d.plan.needs_transcode());
    }

    #[test]
    fn configured_profiles_are_used() {
        let mut profiles = TranscodeConfig::default();
        profiles.audio = EncoderProfile {
            encoder: "libfdk_aac".into(),
            preset: None,
            bitrate: "192k".into(),
        };
        let d = decide(&probe("avc1.640028", "ac-3"), &oracle(), &profiles).unwrap();
        assert_eq!(
            d.plan.ffmpeg_args(),
            vec!["-c:v", "copy", "-c:a", "libfdk_aac", "-b:a", "192k"]
        );
    }

    #[test]
    fn oracle_errors_propagate() {
        let mut profiles = TranscodeConfig::default();
        profiles.target_mime = "video/webm; codecs=\"{codec}\"".into();
        let err = decide(&probe("avc1.640028", "mp4a.40.2"), &oracle(), &profiles).unwrap_err();
        assert!(matches!(err, nx_core::Error::CapabilityQuery(_)));
    }
}
